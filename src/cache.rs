//! Bounded TTL caches
//!
//! [`BoundedTtlSet`] keeps at most `max_size` keys, each expiring after the
//! TTL; when full the oldest entry is evicted on insert. [`ActivityTracker`]
//! builds the committer's idle markers on top of it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::ChainKey;

pub struct BoundedTtlSet<K> {
    map: HashMap<K, Instant>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone> BoundedTtlSet<K> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.get(key).is_some_and(|&t| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, key: K) {
        let now = Instant::now();
        self.map.retain(|_, &mut t| now.duration_since(t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, now);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Idle markers per destination chain.
///
/// The committer marks a chain idle after a pass that found nothing to
/// commit and skips it while the marker lives. The processor clears the
/// marker as soon as it persists a message for that chain.
pub struct ActivityTracker {
    idle: Mutex<BoundedTtlSet<ChainKey>>,
}

impl ActivityTracker {
    pub fn new(max_chains: usize, idle_ttl: Duration) -> Self {
        Self {
            idle: Mutex::new(BoundedTtlSet::new(max_chains, idle_ttl)),
        }
    }

    pub fn mark_active(&self, chain: &ChainKey) {
        self.lock().remove(chain);
    }

    pub fn mark_idle(&self, chain: &ChainKey) {
        self.lock().insert(chain.clone());
    }

    pub fn is_idle(&self, chain: &ChainKey) -> bool {
        self.lock().contains(chain)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoundedTtlSet<ChainKey>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
