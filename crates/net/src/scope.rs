//! Per-connection knowledge of replicated entities.
//!
//! A connection has an entity in scope exactly when it was sent a spawn for
//! it and no despawn since.

use netsync_core::{ConnectionId, NetId};
use std::collections::{BTreeMap, BTreeSet};

/// Server-side scope and ownership bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ScopeTable {
    scopes: BTreeMap<ConnectionId, BTreeSet<NetId>>,
    owners: BTreeMap<NetId, ConnectionId>,
}

impl ScopeTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection with an empty scope.
    pub fn add_connection(&mut self, connection: ConnectionId) {
        self.scopes.entry(connection).or_default();
    }

    /// Stop tracking a connection; returns what it had in scope.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> BTreeSet<NetId> {
        self.owners.retain(|_, owner| *owner != connection);
        self.scopes.remove(&connection).unwrap_or_default()
    }

    /// Known connections in id order.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.scopes.keys().copied()
    }

    /// Returns true if the connection is tracked.
    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.scopes.contains_key(&connection)
    }

    /// Put `net_id` in scope. Returns false if it already was.
    pub fn insert(&mut self, connection: ConnectionId, net_id: NetId) -> bool {
        self.scopes.entry(connection).or_default().insert(net_id)
    }

    /// Take `net_id` out of scope.
    pub fn remove(&mut self, connection: ConnectionId, net_id: NetId) -> bool {
        self.scopes
            .get_mut(&connection)
            .map(|scope| scope.remove(&net_id))
            .unwrap_or(false)
    }

    /// Returns true if `connection` knows `net_id`.
    pub fn contains(&self, connection: ConnectionId, net_id: NetId) -> bool {
        self.scopes
            .get(&connection)
            .map(|scope| scope.contains(&net_id))
            .unwrap_or(false)
    }

    /// Entities in a connection's scope.
    pub fn scope_of(&self, connection: ConnectionId) -> Option<&BTreeSet<NetId>> {
        self.scopes.get(&connection)
    }

    /// Connections that have `net_id` in scope.
    pub fn audience(&self, net_id: NetId) -> Vec<ConnectionId> {
        self.scopes
            .iter()
            .filter(|(_, scope)| scope.contains(&net_id))
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// Record or clear the owner of `net_id`.
    pub fn set_owner(&mut self, net_id: NetId, owner: Option<ConnectionId>) {
        match owner {
            Some(owner) => {
                self.owners.insert(net_id, owner);
            }
            None => {
                self.owners.remove(&net_id);
            }
        }
    }

    /// Owner of `net_id`.
    pub fn owner(&self, net_id: NetId) -> Option<ConnectionId> {
        self.owners.get(&net_id).copied()
    }

    /// Entities owned by `connection`.
    pub fn owned_by(&self, connection: ConnectionId) -> Vec<NetId> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == connection)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forget `net_id` everywhere; returns the connections that had it in scope.
    pub fn purge(&mut self, net_id: NetId) -> Vec<ConnectionId> {
        self.owners.remove(&net_id);
        let mut audience = Vec::new();
        for (conn, scope) in self.scopes.iter_mut() {
            if scope.remove(&net_id) {
                audience.push(*conn);
            }
        }
        audience
    }

    /// Returns true if any scope or the owner map mentions `net_id`.
    pub fn mentions(&self, net_id: NetId) -> bool {
        self.owners.contains_key(&net_id) || self.scopes.values().any(|s| s.contains(&net_id))
    }
}
