//! Bounded recent-key set for duplicate suppression.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
};

/// Remembers the most recently inserted keys up to `capacity`.
///
/// When full, the oldest 10% (at least one) are evicted in insertion order.
///
/// # Invariants
///
/// - `seen` and `order` hold the same keys.
/// - `len() <= capacity`.
#[derive(Debug, Clone)]
pub struct RecentSet<K> {
    seen: HashSet<K>,
    order: VecDeque<K>,
    capacity: usize,
    evicted: u64,
}

impl<K: Clone + Eq + Hash> RecentSet<K> {
    /// Empty set holding at most `capacity` keys (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Record `key`. Returns true if it was not already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            let batch = (self.capacity / 10).max(1);
            for _ in 0..batch {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                    self.evicted += 1;
                }
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        debug_assert_eq!(self.seen.len(), self.order.len());
        true
    }

    /// Whether `key` is remembered.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Keys remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys evicted so far.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
