//! In-memory broker for tests, simulation and single-process deployments.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{Broker, BrokerError, Hub, Published};

const DEFAULT_INBOX_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| now_ms < at)
    }
}

#[derive(Debug, Clone, Default)]
struct List {
    items: VecDeque<Vec<u8>>,
    expires_at_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    kv: HashMap<String, Entry>,
    lists: HashMap<String, List>,
    hub: Hub,
    available: bool,
    operations: u64,
}

/// Shared in-process broker.
///
/// Clones share state, so several simulated instances can hold handles to the
/// same broker. [`MemoryBroker::set_available`] simulates an outage: while
/// down every operation fails, and going down forgets all subscriptions the
/// way a restarted broker would.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Empty, available broker.
    pub fn new() -> Self {
        Self::with_inbox_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// Empty broker whose per-subscriber inbox holds at most `capacity`
    /// undelivered messages.
    pub fn with_inbox_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                kv: HashMap::new(),
                lists: HashMap::new(),
                hub: Hub::new(capacity),
                available: true,
                operations: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn op(&self) -> Result<MutexGuard<'_, Inner>, BrokerError> {
        let mut inner = self.state();
        inner.operations += 1;
        if !inner.available {
            return Err(BrokerError::Unavailable("memory broker is down".to_string()));
        }
        Ok(inner)
    }

    /// Bring the broker up or down. Going down drops every subscription.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.state();
        if inner.available && !available {
            inner.hub.reset();
        }
        inner.available = available;
    }

    /// Whether the broker currently accepts operations.
    pub fn is_available(&self) -> bool {
        self.state().available
    }

    /// Operations attempted, including failed ones.
    pub fn operation_count(&self) -> u64 {
        self.state().operations
    }

    /// Patterns currently registered for `subscriber`.
    pub fn subscriptions(&self, subscriber: &str) -> Vec<String> {
        self.state().hub.patterns(subscriber)
    }

    /// Messages dropped from full subscriber inboxes.
    pub fn dropped_messages(&self) -> u64 {
        self.state().hub.dropped()
    }
}

impl Broker for MemoryBroker {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<Vec<u8>>, BrokerError> {
        let inner = self.op()?;
        Ok(inner.kv.get(key).filter(|e| e.live(now_ms)).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], expires_at_ms: Option<u64>) -> Result<(), BrokerError> {
        let mut inner = self.op()?;
        inner.kv.insert(key.to_string(), Entry { value: value.to_vec(), expires_at_ms });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let mut inner = self.op()?;
        let removed = inner.kv.remove(key).is_some();
        let removed_list = inner.lists.remove(key).is_some();
        Ok(removed || removed_list)
    }

    fn keys(&self, prefix: &str, now_ms: u64) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.op()?;
        inner.kv.retain(|_, e| e.live(now_ms));
        Ok(inner.kv.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    fn push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        expires_at_ms: Option<u64>,
    ) -> Result<usize, BrokerError> {
        let mut inner = self.op()?;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.items.push_back(value.to_vec());
        while list.items.len() > max_len.max(1) {
            list.items.pop_front();
        }
        list.expires_at_ms = expires_at_ms;
        Ok(list.items.len())
    }

    fn drain(&self, key: &str, now_ms: u64) -> Result<Vec<Vec<u8>>, BrokerError> {
        let mut inner = self.op()?;
        match inner.lists.remove(key) {
            Some(list) if list.expires_at_ms.is_none_or(|at| now_ms < at) => {
                Ok(list.items.into_iter().collect())
            },
            _ => Ok(Vec::new()),
        }
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        let mut inner = self.op()?;
        Ok(inner.hub.publish(channel, payload))
    }

    fn subscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut inner = self.op()?;
        inner.hub.subscribe(subscriber, pattern);
        Ok(())
    }

    fn unsubscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut inner = self.op()?;
        inner.hub.unsubscribe(subscriber, pattern);
        Ok(())
    }

    fn poll(&self, subscriber: &str, max: usize) -> Result<Vec<Published>, BrokerError> {
        let mut inner = self.op()?;
        Ok(inner.hub.poll(subscriber, max))
    }

    fn ping(&self) -> Result<(), BrokerError> {
        self.op().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_hides_expired_values() {
        let broker = MemoryBroker::new();
        broker.set("session:a", b"v", Some(1_000)).unwrap();
        assert_eq!(broker.get("session:a", 999).unwrap(), Some(b"v".to_vec()));
        assert_eq!(broker.get("session:a", 1_000).unwrap(), None);
        assert!(broker.keys("session:", 1_000).unwrap().is_empty());
    }

    #[test]
    fn lists_are_bounded_oldest_first() {
        let broker = MemoryBroker::new();
        for i in 0..5u8 {
            broker.push("offline_messages:u", &[i], 3, None).unwrap();
        }
        let items = broker.drain("offline_messages:u", 0).unwrap();
        assert_eq!(items, vec![vec![2], vec![3], vec![4]]);
        assert!(broker.drain("offline_messages:u", 0).unwrap().is_empty());
    }

    #[test]
    fn outage_fails_operations_and_drops_subscriptions() {
        let broker = MemoryBroker::new();
        broker.subscribe("srv-a", "chat*").unwrap();

        broker.set_available(false);
        assert!(matches!(broker.publish("chat", b"x"), Err(BrokerError::Unavailable(_))));
        assert!(broker.ping().is_err());

        broker.set_available(true);
        assert!(broker.subscriptions("srv-a").is_empty());
        assert_eq!(broker.publish("chat", b"x").unwrap(), 0);
    }

    #[test]
    fn clones_share_state() {
        let a = MemoryBroker::new();
        let b = a.clone();
        a.set("k", b"v", None).unwrap();
        assert_eq!(b.get("k", 0).unwrap(), Some(b"v".to_vec()));
    }
}
