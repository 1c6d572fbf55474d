//! The replicated entity store.
//!
//! Identity registry, scope table, change cache and per-component reference
//! counts are four maps that must agree with each other. They live behind
//! this one type, and only [`ReplicatedEntityStore::unregister`] removes an
//! entity from them, always from all four at once.

use crate::change_cache::ChangeCache;
use crate::registry::IdentityRegistry;
use crate::scope::ScopeTable;
use netsync_core::{ConnectionId, NetId, SyncRule};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Cached rule set of a tracked entity.
pub type RuleSet = BTreeMap<String, SyncRule>;

/// Result of removing an entity from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered<E> {
    /// Handle the net id was bound to.
    pub entity: Option<E>,
    /// Connections that had the entity in scope.
    pub audience: Vec<ConnectionId>,
}

/// Registry, scope, change cache and refcounts kept in lockstep.
#[derive(Debug, Clone)]
pub struct ReplicatedEntityStore<E> {
    identities: IdentityRegistry<E>,
    scope: ScopeTable,
    changes: ChangeCache,
    rules: BTreeMap<E, RuleSet>,
    refcounts: BTreeMap<String, usize>,
}

impl<E> Default for ReplicatedEntityStore<E> {
    fn default() -> Self {
        Self {
            identities: IdentityRegistry::default(),
            scope: ScopeTable::default(),
            changes: ChangeCache::default(),
            rules: BTreeMap::new(),
            refcounts: BTreeMap::new(),
        }
    }
}

impl<E: Copy + Ord> ReplicatedEntityStore<E> {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in a handle that co-located roles can share.
    pub fn shared() -> SharedRegistry<E> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Start or refresh tracking of an entity's rule set.
    ///
    /// Returns true if the entity was not tracked before. Refreshing adjusts
    /// the refcounts of added and dropped component types.
    pub fn track(&mut self, entity: E, rules: RuleSet) -> bool {
        let previous = self.rules.remove(&entity);
        let is_new = previous.is_none();
        let previous = previous.unwrap_or_default();

        for name in previous.keys().filter(|n| !rules.contains_key(*n)) {
            self.release(name);
        }
        for name in rules.keys().filter(|n| !previous.contains_key(*n)) {
            *self.refcounts.entry(name.clone()).or_insert(0) += 1;
        }
        self.rules.insert(entity, rules);
        is_new
    }

    /// Stop tracking an entity.
    pub fn untrack(&mut self, entity: E) -> Option<RuleSet> {
        let rules = self.rules.remove(&entity)?;
        for name in rules.keys() {
            self.release(name);
        }
        Some(rules)
    }

    fn release(&mut self, name: &str) {
        if let Some(count) = self.refcounts.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.refcounts.remove(name);
            }
        }
    }

    /// Cached rule set of a tracked entity.
    pub fn rules(&self, entity: E) -> Option<&RuleSet> {
        self.rules.get(&entity)
    }

    /// Returns true if the entity is tracked.
    pub fn is_tracked(&self, entity: E) -> bool {
        self.rules.contains_key(&entity)
    }

    /// Tracked entities in handle order.
    pub fn tracked(&self) -> impl Iterator<Item = E> + '_ {
        self.rules.keys().copied()
    }

    /// Number of tracked entities declaring `component`.
    pub fn refcount(&self, component: &str) -> usize {
        self.refcounts.get(component).copied().unwrap_or(0)
    }

    /// Component types declared by at least one tracked entity.
    pub fn referenced_components(&self) -> Vec<String> {
        self.refcounts.keys().cloned().collect()
    }

    /// Bind `net_id` to `entity`.
    pub fn register(&mut self, net_id: NetId, entity: E) {
        self.identities.register(net_id, entity);
    }

    /// Remove `net_id` from every map.
    pub fn unregister(&mut self, net_id: NetId) -> Unregistered<E> {
        let entity = self.identities.unregister(net_id);
        self.changes.purge(net_id);
        let audience = self.scope.purge(net_id);
        if let Some(entity) = entity {
            self.untrack(entity);
        }
        Unregistered { entity, audience }
    }

    /// Local handle of `net_id`.
    pub fn resolve(&self, net_id: NetId) -> Option<E> {
        self.identities.resolve(net_id)
    }

    /// Net id bound to `entity`.
    pub fn net_id_of(&self, entity: E) -> Option<NetId> {
        self.identities.net_id_of(entity)
    }

    /// Identity registry.
    pub fn identities(&self) -> &IdentityRegistry<E> {
        &self.identities
    }

    /// Mutable identity registry, for `my_net_id` bookkeeping.
    pub fn identities_mut(&mut self) -> &mut IdentityRegistry<E> {
        &mut self.identities
    }

    /// Scope table.
    pub fn scope(&self) -> &ScopeTable {
        &self.scope
    }

    /// Mutable scope table.
    pub fn scope_mut(&mut self) -> &mut ScopeTable {
        &mut self.scope
    }

    /// Change cache.
    pub fn changes(&self) -> &ChangeCache {
        &self.changes
    }

    /// Mutable change cache.
    pub fn changes_mut(&mut self) -> &mut ChangeCache {
        &mut self.changes
    }

    /// Returns true if `net_id` appears in no map at all.
    pub fn is_forgotten(&self, net_id: NetId) -> bool {
        !self.identities.contains(net_id)
            && !self.changes.contains(net_id)
            && !self.scope.mentions(net_id)
    }
}

/// Store handle shared by roles running in one process.
pub type SharedRegistry<E> = Rc<RefCell<ReplicatedEntityStore<E>>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(names: &[&str]) -> RuleSet {
        names
            .iter()
            .map(|n| (n.to_string(), SyncRule::default()))
            .collect()
    }

    #[test]
    fn test_track_adjusts_refcounts() {
        let mut store = ReplicatedEntityStore::new();
        assert!(store.track(1u32, rules(&["Transform", "Health"])));
        assert!(store.track(2, rules(&["Transform"])));
        assert_eq!(store.refcount("Transform"), 2);

        assert!(!store.track(1, rules(&["Transform", "Mana"])));
        assert_eq!(store.refcount("Health"), 0);
        assert_eq!(store.refcount("Mana"), 1);
        assert_eq!(store.referenced_components(), vec!["Mana", "Transform"]);

        store.untrack(2);
        assert_eq!(store.refcount("Transform"), 1);
    }

    #[test]
    fn test_unregister_cascades() {
        let mut store = ReplicatedEntityStore::new();
        let a = ConnectionId(1);
        store.track(9u32, rules(&["Transform"]));
        store.register(NetId(5), 9);
        store.scope_mut().insert(a, NetId(5));
        store.scope_mut().set_owner(NetId(5), Some(a));
        store.changes_mut().record(NetId(5), "Transform", 1, 0.0);

        let removed = store.unregister(NetId(5));
        assert_eq!(removed.entity, Some(9));
        assert_eq!(removed.audience, vec![a]);
        assert!(store.is_forgotten(NetId(5)));
        assert!(!store.is_tracked(9));
        assert_eq!(store.refcount("Transform"), 0);
    }

    #[test]
    fn test_shared_handle_sees_same_state() {
        let shared = ReplicatedEntityStore::<u32>::shared();
        let other = Rc::clone(&shared);
        shared.borrow_mut().register(NetId(1), 3);
        assert_eq!(other.borrow().resolve(NetId(1)), Some(3));
    }
}
