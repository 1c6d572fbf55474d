//! Net id allocation and the `net_id <-> handle` registry.

use netsync_core::{NetId, NET_ID_BLOCK};
use std::collections::BTreeMap;
use thiserror::Error;

/// Net id allocation failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdAllocError {
    /// The peer has not been assigned a prefix yet.
    #[error("no net id prefix assigned")]
    NoPrefix,
    /// All counters of the prefix block were handed out.
    #[error("net id block of prefix {prefix} is exhausted")]
    Exhausted {
        /// Exhausted prefix.
        prefix: u32,
    },
}

/// Per-peer allocator of `prefix * 10000 + counter` ids.
#[derive(Debug, Clone, Default)]
pub struct NetIdAllocator {
    prefix: Option<u32>,
    counter: u64,
}

impl NetIdAllocator {
    /// Allocator with no prefix; allocation fails until one is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator for a known prefix.
    pub fn with_prefix(prefix: u32) -> Self {
        Self {
            prefix: Some(prefix),
            counter: 0,
        }
    }

    /// Adopt a prefix. Switching to a different prefix restarts the counter.
    pub fn set_prefix(&mut self, prefix: u32) {
        if self.prefix != Some(prefix) {
            self.prefix = Some(prefix);
            self.counter = 0;
        }
    }

    /// Current prefix.
    pub fn prefix(&self) -> Option<u32> {
        self.prefix
    }

    /// Allocate the next id.
    pub fn next_net_id(&mut self) -> Result<NetId, IdAllocError> {
        let prefix = self.prefix.ok_or(IdAllocError::NoPrefix)?;
        if self.counter + 1 >= NET_ID_BLOCK {
            return Err(IdAllocError::Exhausted { prefix });
        }
        self.counter += 1;
        Ok(NetId::compose(prefix, self.counter))
    }
}

/// Bidirectional `net_id <-> handle` map plus the local player's id.
#[derive(Debug, Clone)]
pub struct IdentityRegistry<E> {
    by_net_id: BTreeMap<NetId, E>,
    by_entity: BTreeMap<E, NetId>,
    my_net_id: Option<NetId>,
}

impl<E> Default for IdentityRegistry<E> {
    fn default() -> Self {
        Self {
            by_net_id: BTreeMap::new(),
            by_entity: BTreeMap::new(),
            my_net_id: None,
        }
    }
}

impl<E: Copy + Ord> IdentityRegistry<E> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `net_id` to `entity`, replacing any earlier binding of either.
    pub fn register(&mut self, net_id: NetId, entity: E) {
        if let Some(old) = self.by_net_id.insert(net_id, entity) {
            self.by_entity.remove(&old);
        }
        if let Some(old) = self.by_entity.insert(entity, net_id) {
            if old != net_id {
                self.by_net_id.remove(&old);
            }
        }
    }

    /// Remove the binding of `net_id`.
    pub fn unregister(&mut self, net_id: NetId) -> Option<E> {
        let entity = self.by_net_id.remove(&net_id)?;
        self.by_entity.remove(&entity);
        Some(entity)
    }

    /// Local handle of `net_id`.
    pub fn resolve(&self, net_id: NetId) -> Option<E> {
        self.by_net_id.get(&net_id).copied()
    }

    /// Net id bound to `entity`.
    pub fn net_id_of(&self, entity: E) -> Option<NetId> {
        self.by_entity.get(&entity).copied()
    }

    /// Returns true if `net_id` is bound.
    pub fn contains(&self, net_id: NetId) -> bool {
        self.by_net_id.contains_key(&net_id)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.by_net_id.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.by_net_id.is_empty()
    }

    /// Bindings in net id order.
    pub fn iter(&self) -> impl Iterator<Item = (NetId, E)> + '_ {
        self.by_net_id.iter().map(|(id, e)| (*id, *e))
    }

    /// Net id of the local player's own entity.
    pub fn my_net_id(&self) -> Option<NetId> {
        self.my_net_id
    }

    /// Record the local player's own entity.
    pub fn set_my_net_id(&mut self, net_id: Option<NetId>) {
        self.my_net_id = net_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_three_allocates_block() {
        let mut alloc = NetIdAllocator::with_prefix(3);
        let ids: Vec<u64> = (0..3).map(|_| alloc.next_net_id().expect("id").0).collect();
        assert_eq!(ids, vec![30001, 30002, 30003]);
    }

    #[test]
    fn test_allocation_needs_prefix() {
        let mut alloc = NetIdAllocator::new();
        assert_eq!(alloc.next_net_id(), Err(IdAllocError::NoPrefix));
        alloc.set_prefix(2);
        assert_eq!(alloc.next_net_id(), Ok(NetId(20001)));
        alloc.set_prefix(2);
        assert_eq!(alloc.next_net_id(), Ok(NetId(20002)));
    }

    #[test]
    fn test_block_exhaustion() {
        let mut alloc = NetIdAllocator::with_prefix(1);
        for _ in 0..9999 {
            alloc.next_net_id().expect("id");
        }
        assert_eq!(
            alloc.next_net_id(),
            Err(IdAllocError::Exhausted { prefix: 1 })
        );
    }

    #[test]
    fn test_registry_is_bidirectional() {
        let mut registry = IdentityRegistry::new();
        registry.register(NetId(5), 50u32);
        assert_eq!(registry.resolve(NetId(5)), Some(50));
        assert_eq!(registry.net_id_of(50), Some(NetId(5)));

        registry.register(NetId(6), 50);
        assert_eq!(registry.resolve(NetId(5)), None);
        assert_eq!(registry.net_id_of(50), Some(NetId(6)));

        assert_eq!(registry.unregister(NetId(6)), Some(50));
        assert!(registry.is_empty());
        assert_eq!(registry.unregister(NetId(6)), None);
    }
}
