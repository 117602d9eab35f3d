//! Cancellable deadline queue.
//!
//! Heartbeats, ack timeouts, typing expiry and deferred session eviction are
//! all keyed deadlines. Each key has at most one pending deadline: scheduling
//! an existing key replaces it, and cancellation is an explicit, observable
//! operation instead of a dropped callback.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};

use crate::env::Instant;

/// Deadline queue keyed by `K`.
///
/// Expired keys are returned in deadline order; ties fire in scheduling order.
///
/// # Invariants
///
/// - Every key appears at most once.
/// - `by_key` and `deadlines` always describe the same set of timers.
#[derive(Debug, Clone)]
pub struct TimerWheel<I, K> {
    deadlines: BTreeMap<(I, u64), K>,
    by_key: HashMap<K, (I, u64)>,
    next_seq: u64,
}

impl<I, K> Default for TimerWheel<I, K>
where
    I: Instant,
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I, K> TimerWheel<I, K>
where
    I: Instant,
    K: Clone + Eq + Hash,
{
    /// Empty wheel.
    #[must_use]
    pub fn new() -> Self {
        Self { deadlines: BTreeMap::new(), by_key: HashMap::new(), next_seq: 0 }
    }

    /// Arm `key` to fire at `deadline`, replacing any pending deadline for it.
    pub fn schedule(&mut self, key: K, deadline: I) {
        self.cancel(&key);
        let slot = (deadline, self.next_seq);
        self.next_seq += 1;
        self.deadlines.insert(slot, key.clone());
        self.by_key.insert(key, slot);
        debug_assert_eq!(self.deadlines.len(), self.by_key.len());
    }

    /// Disarm `key`. Returns true if it was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.by_key.remove(key) {
            Some(slot) => {
                self.deadlines.remove(&slot);
                true
            },
            None => false,
        }
    }

    /// Disarm every key matching `predicate`. Returns how many were removed.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let doomed: Vec<K> = self.by_key.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &doomed {
            self.cancel(key);
        }
        doomed.len()
    }

    /// Pending deadline for `key`.
    #[must_use]
    pub fn deadline(&self, key: &K) -> Option<I> {
        self.by_key.get(key).map(|(deadline, _)| *deadline)
    }

    /// Whether `key` is armed.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every key whose deadline is at or before `now`.
    pub fn poll_expired(&mut self, now: I) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.by_key.remove(&key);
            expired.push(key);
        }
        expired
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no timers are armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Iterate over armed keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.by_key.keys()
    }
}
