//! Spawns waiting for their parent to arrive.

use crate::protocol::SpawnMessage;
use netsync_core::{ConnectionId, NetId};
use std::collections::BTreeMap;

/// A deferred spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSpawn {
    /// Connection the spawn came from.
    pub from: ConnectionId,
    /// The spawn itself.
    pub spawn: SpawnMessage,
    /// Sender tick of the spawn.
    pub sent_tick: u64,
    /// Arrival time in seconds.
    pub arrived_at: f64,
}

/// Child spawns keyed by their own net id.
#[derive(Debug, Clone, Default)]
pub struct PendingChildren {
    entries: BTreeMap<NetId, PendingSpawn>,
}

impl PendingChildren {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a spawn whose parent is unknown. A newer spawn for the same net
    /// id replaces the older one but keeps the original arrival time.
    pub fn defer(&mut self, from: ConnectionId, spawn: SpawnMessage, sent_tick: u64, now: f64) {
        let arrived_at = self
            .entries
            .get(&spawn.net_id)
            .map(|p| p.arrived_at)
            .unwrap_or(now);
        self.entries.insert(
            spawn.net_id,
            PendingSpawn {
                from,
                spawn,
                sent_tick,
                arrived_at,
            },
        );
    }

    /// Remove and return every spawn waiting on `parent`.
    pub fn take_children_of(&mut self, parent: NetId) -> Vec<PendingSpawn> {
        let ready: Vec<NetId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.spawn.parent_net_id == Some(parent))
            .map(|(id, _)| *id)
            .collect();
        ready
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Drop a pending spawn, e.g. when its despawn arrives first.
    pub fn remove(&mut self, net_id: NetId) -> Option<PendingSpawn> {
        self.entries.remove(&net_id)
    }

    /// Drop spawns older than `timeout` seconds; returns their net ids.
    pub fn expire(&mut self, now: f64, timeout: f64) -> Vec<NetId> {
        let expired: Vec<NetId> = self
            .entries
            .iter()
            .filter(|(_, p)| now - p.arrived_at > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Returns true if a spawn for `net_id` is parked.
    pub fn contains(&self, net_id: NetId) -> bool {
        self.entries.contains_key(&net_id)
    }

    /// Number of parked spawns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_core::{Authority, ComponentMap};

    fn child(net_id: u64, parent: u64) -> SpawnMessage {
        SpawnMessage {
            net_id: NetId(net_id),
            owner_client: None,
            authority: Authority::Server,
            parent_net_id: Some(NetId(parent)),
            components: ComponentMap::new(),
        }
    }

    #[test]
    fn test_take_children_of_parent() {
        let mut pending = PendingChildren::new();
        pending.defer(ConnectionId::SERVER, child(5, 9), 1, 0.0);
        pending.defer(ConnectionId::SERVER, child(6, 9), 1, 0.0);
        pending.defer(ConnectionId::SERVER, child(7, 5), 1, 0.0);

        let ready = pending.take_children_of(NetId(9));
        let ids: Vec<NetId> = ready.iter().map(|p| p.spawn.net_id).collect();
        assert_eq!(ids, vec![NetId(5), NetId(6)]);
        assert!(pending.contains(NetId(7)));
    }

    #[test]
    fn test_expire_keeps_first_arrival() {
        let mut pending = PendingChildren::new();
        pending.defer(ConnectionId::SERVER, child(5, 9), 1, 0.0);
        pending.defer(ConnectionId::SERVER, child(5, 9), 1, 4.0);

        assert!(pending.expire(4.5, 5.0).is_empty());
        assert_eq!(pending.expire(5.5, 5.0), vec![NetId(5)]);
        assert!(pending.is_empty());
    }
}
