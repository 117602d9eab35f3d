//! Broker abstraction.
//!
//! The broker is the only store shared between instances: a key-value
//! namespace with expiry, bounded lists, and publish/subscribe channels. The
//! trait is synchronous so every component stays deterministic under
//! simulation; the production runtime calls it from the driver task.
//!
//! Expiry is expressed as absolute wall-clock milliseconds supplied by the
//! caller, so backends never read a clock themselves.

mod chaotic;
mod memory;
mod redb;

use std::collections::{BTreeSet, HashMap, VecDeque};

pub use chaotic::ChaoticBroker;
pub use memory::MemoryBroker;
use thiserror::Error;

pub use self::redb::RedbBroker;

/// Errors from broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable. Trips the fabric breaker.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Backend I/O failure
    #[error("broker I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Returns true if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Concrete channel the message was published on
    pub channel: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Shared key-value store with pub/sub channels.
///
/// Must be Clone (every component holds a handle), Send + Sync, and
/// synchronous. Clones share the same underlying store.
pub trait Broker: Clone + Send + Sync + 'static {
    /// Value at `key`, unless absent or expired at `now_ms`.
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Store `value` at `key`, replacing any previous value (last write wins).
    fn set(&self, key: &str, value: &[u8], expires_at_ms: Option<u64>) -> Result<(), BrokerError>;

    /// Remove `key`. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, BrokerError>;

    /// Live keys starting with `prefix`. Order is not guaranteed.
    fn keys(&self, prefix: &str, now_ms: u64) -> Result<Vec<String>, BrokerError>;

    /// Append to the list at `key`, dropping the oldest items beyond
    /// `max_len`. Returns the new length.
    fn push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        expires_at_ms: Option<u64>,
    ) -> Result<usize, BrokerError>;

    /// Remove and return every item of the list at `key`, oldest first.
    fn drain(&self, key: &str, now_ms: u64) -> Result<Vec<Vec<u8>>, BrokerError>;

    /// Publish to `channel`. Returns the number of subscribers reached.
    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError>;

    /// Register `subscriber` for channels matching `pattern` (`*` wildcard).
    fn subscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError>;

    /// Remove one pattern registration.
    fn unsubscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError>;

    /// Take up to `max` pending messages for `subscriber`, oldest first.
    fn poll(&self, subscriber: &str, max: usize) -> Result<Vec<Published>, BrokerError>;

    /// Liveness probe.
    fn ping(&self) -> Result<(), BrokerError>;
}

/// Key of a user's presence marker. Present while the user is connected to
/// some instance.
pub fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

/// Key of a user's offline mailbox list.
pub fn mailbox_key(user_id: &str) -> String {
    format!("offline_messages:{user_id}")
}

/// Glob match with `*` matching any run of characters.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == channel;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    let Some(mut remaining) = channel.strip_prefix(first) else {
        return false;
    };

    for part in &parts[1..parts.len() - 1] {
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[derive(Debug, Default)]
struct Subscriber {
    patterns: BTreeSet<String>,
    inbox: VecDeque<Published>,
}

/// In-process pub/sub fan-out shared by the backends.
#[derive(Debug)]
pub(crate) struct Hub {
    subscribers: HashMap<String, Subscriber>,
    inbox_capacity: usize,
    dropped: u64,
}

impl Hub {
    pub(crate) fn new(inbox_capacity: usize) -> Self {
        Self { subscribers: HashMap::new(), inbox_capacity: inbox_capacity.max(1), dropped: 0 }
    }

    pub(crate) fn publish(&mut self, channel: &str, payload: &[u8]) -> usize {
        let mut reached = 0;
        for sub in self.subscribers.values_mut() {
            if !sub.patterns.iter().any(|p| pattern_matches(p, channel)) {
                continue;
            }
            if sub.inbox.len() >= self.inbox_capacity {
                sub.inbox.pop_front();
                self.dropped += 1;
            }
            sub.inbox
                .push_back(Published { channel: channel.to_string(), payload: payload.to_vec() });
            reached += 1;
        }
        reached
    }

    pub(crate) fn subscribe(&mut self, subscriber: &str, pattern: &str) {
        self.subscribers.entry(subscriber.to_string()).or_default().patterns.insert(pattern.into());
    }

    pub(crate) fn unsubscribe(&mut self, subscriber: &str, pattern: &str) {
        if let Some(sub) = self.subscribers.get_mut(subscriber) {
            sub.patterns.remove(pattern);
        }
    }

    pub(crate) fn poll(&mut self, subscriber: &str, max: usize) -> Vec<Published> {
        let Some(sub) = self.subscribers.get_mut(subscriber) else {
            return Vec::new();
        };
        let n = max.min(sub.inbox.len());
        sub.inbox.drain(..n).collect()
    }

    /// Forget every subscription and pending message, as a broker restart
    /// would.
    pub(crate) fn reset(&mut self) {
        self.subscribers.clear();
    }

    pub(crate) fn patterns(&self, subscriber: &str) -> Vec<String> {
        self.subscribers
            .get(subscriber)
            .map(|s| s.patterns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(pattern_matches("chat", "chat"));
        assert!(!pattern_matches("chat", "chat:high"));
        assert!(pattern_matches("chat*", "chat:high"));
        assert!(pattern_matches("chat*", "chat"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a*c*e", "abcde"));
        assert!(!pattern_matches("a*c*e", "abcd"));
        assert!(!pattern_matches("ab*ba", "aba"));
    }

    #[test]
    fn hub_fans_out_to_matching_subscribers() {
        let mut hub = Hub::new(8);
        hub.subscribe("a", "chat*");
        hub.subscribe("b", "acks");

        assert_eq!(hub.publish("chat:high", b"x"), 1);
        assert_eq!(hub.poll("a", 10).len(), 1);
        assert!(hub.poll("b", 10).is_empty());
    }

    #[test]
    fn hub_inbox_is_bounded() {
        let mut hub = Hub::new(2);
        hub.subscribe("a", "*");
        for i in 0..5u8 {
            hub.publish("c", &[i]);
        }
        let got = hub.poll("a", 10);
        assert_eq!(got.iter().map(|p| p.payload[0]).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(hub.dropped(), 3);
    }
}
