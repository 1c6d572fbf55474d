//! Last-sent hash and timestamp per replicated component.

use netsync_core::NetId;
use std::collections::BTreeMap;

/// What was last sent for one component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentRecord {
    /// Canonical hash of the value.
    pub hash: u64,
    /// Send time in seconds; `-inf` when only the value is known.
    pub sent_at: f64,
}

/// Outcome of a send check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Value changed and the rate interval elapsed.
    Send,
    /// Value equals the last one sent.
    Unchanged,
    /// Value changed but the rate interval has not elapsed yet.
    RateLimited,
}

/// Per-entity, per-component change tracker.
#[derive(Debug, Clone, Default)]
pub struct ChangeCache {
    entries: BTreeMap<NetId, BTreeMap<String, SentRecord>>,
}

impl ChangeCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a component with hash `hash` may be sent at `now`.
    pub fn check(
        &self,
        net_id: NetId,
        component: &str,
        hash: u64,
        now: f64,
        min_interval: f64,
    ) -> SendDecision {
        match self.get(net_id, component) {
            None => SendDecision::Send,
            Some(record) if record.hash == hash => SendDecision::Unchanged,
            Some(record) if now - record.sent_at < min_interval => SendDecision::RateLimited,
            Some(_) => SendDecision::Send,
        }
    }

    /// Record a send.
    pub fn record(&mut self, net_id: NetId, component: &str, hash: u64, now: f64) {
        self.entries
            .entry(net_id)
            .or_default()
            .insert(component.to_string(), SentRecord { hash, sent_at: now });
    }

    /// Restart the rate interval of a component without changing its hash.
    pub fn touch(&mut self, net_id: NetId, component: &str, now: f64) {
        if let Some(record) = self
            .entries
            .get_mut(&net_id)
            .and_then(|c| c.get_mut(component))
        {
            record.sent_at = now;
        }
    }

    /// Remember a value that arrived from the network, keeping the last send
    /// time so received state is never echoed back unchanged.
    pub fn remember(&mut self, net_id: NetId, component: &str, hash: u64) {
        let slot = self
            .entries
            .entry(net_id)
            .or_default()
            .entry(component.to_string())
            .or_insert(SentRecord {
                hash,
                sent_at: f64::NEG_INFINITY,
            });
        slot.hash = hash;
    }

    /// Last record of a component.
    pub fn get(&self, net_id: NetId, component: &str) -> Option<&SentRecord> {
        self.entries.get(&net_id).and_then(|c| c.get(component))
    }

    /// Forget one component.
    pub fn forget(&mut self, net_id: NetId, component: &str) {
        if let Some(components) = self.entries.get_mut(&net_id) {
            components.remove(component);
            if components.is_empty() {
                self.entries.remove(&net_id);
            }
        }
    }

    /// Forget every component of `net_id`.
    pub fn purge(&mut self, net_id: NetId) {
        self.entries.remove(&net_id);
    }

    /// Returns true if anything is cached for `net_id`.
    pub fn contains(&self, net_id: NetId) -> bool {
        self.entries.contains_key(&net_id)
    }

    /// Number of entities with cached records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_send_always_allowed() {
        let cache = ChangeCache::new();
        assert_eq!(cache.check(NetId(1), "T", 9, 0.0, 1.0), SendDecision::Send);
    }

    #[test]
    fn test_unchanged_wins_over_elapsed_interval() {
        let mut cache = ChangeCache::new();
        cache.record(NetId(1), "T", 9, 0.0);
        assert_eq!(
            cache.check(NetId(1), "T", 9, 100.0, 0.1),
            SendDecision::Unchanged
        );
    }

    #[test]
    fn test_rate_limit_interval() {
        let mut cache = ChangeCache::new();
        cache.record(NetId(1), "T", 1, 1.0);
        assert_eq!(
            cache.check(NetId(1), "T", 2, 1.05, 0.1),
            SendDecision::RateLimited
        );
        assert_eq!(cache.check(NetId(1), "T", 2, 1.1, 0.1), SendDecision::Send);
    }

    #[test]
    fn test_touch_restarts_interval_only() {
        let mut cache = ChangeCache::new();
        cache.record(NetId(2), "T", 1, 0.0);
        cache.touch(NetId(2), "T", 1.0);
        assert_eq!(cache.check(NetId(2), "T", 1, 5.0, 0.1), SendDecision::Unchanged);
        assert_eq!(
            cache.check(NetId(2), "T", 2, 1.05, 0.1),
            SendDecision::RateLimited
        );

        cache.touch(NetId(3), "T", 1.0);
        assert!(!cache.contains(NetId(3)));
    }

    #[test]
    fn test_remember_keeps_send_time() {
        let mut cache = ChangeCache::new();
        cache.remember(NetId(4), "Hp", 3);
        assert_eq!(cache.check(NetId(4), "Hp", 3, 0.0, 1.0), SendDecision::Unchanged);
        assert_eq!(cache.check(NetId(4), "Hp", 5, 0.0, 1.0), SendDecision::Send);

        cache.record(NetId(4), "Hp", 5, 2.0);
        cache.remember(NetId(4), "Hp", 6);
        assert_eq!(cache.get(NetId(4), "Hp").map(|r| r.sent_at), Some(2.0));

        cache.purge(NetId(4));
        assert!(!cache.contains(NetId(4)));
    }
}
