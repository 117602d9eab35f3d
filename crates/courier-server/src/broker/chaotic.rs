//! Fault-injecting broker wrapper.
//!
//! Delegates to another broker but fails a seeded, reproducible fraction of
//! operations with `Unavailable`. Used to drive the fabric breaker, the
//! offline queue and the delivery retry paths in tests.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use super::{Broker, BrokerError, Published};

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Linear congruential generator; reproducible for a given seed.
#[derive(Debug)]
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

/// Broker wrapper that randomly fails operations.
///
/// Clones share the RNG and the counters.
#[derive(Debug, Clone)]
pub struct ChaoticBroker<B: Broker> {
    inner: B,
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operations: Arc<AtomicU64>,
    injected: Arc<AtomicU64>,
}

impl<B: Broker> ChaoticBroker<B> {
    /// Wrap `inner`, failing roughly `failure_rate` of operations. The rate is
    /// clamped to [0.0, 1.0].
    pub fn new(inner: B, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Same as [`ChaoticBroker::new`] with an explicit seed.
    pub fn with_seed(inner: B, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operations: Arc::new(AtomicU64::new(0)),
            injected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrapped broker, for checking state after a chaos run.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Operations attempted through this wrapper.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Operations failed on purpose.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn chaos(&self, op: &str) -> Result<(), BrokerError> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(BrokerError::Unavailable(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

impl<B: Broker> Broker for ChaoticBroker<B> {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<Vec<u8>>, BrokerError> {
        self.chaos("get")?;
        self.inner.get(key, now_ms)
    }

    fn set(&self, key: &str, value: &[u8], expires_at_ms: Option<u64>) -> Result<(), BrokerError> {
        self.chaos("set")?;
        self.inner.set(key, value, expires_at_ms)
    }

    fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        self.chaos("delete")?;
        self.inner.delete(key)
    }

    fn keys(&self, prefix: &str, now_ms: u64) -> Result<Vec<String>, BrokerError> {
        self.chaos("keys")?;
        self.inner.keys(prefix, now_ms)
    }

    fn push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        expires_at_ms: Option<u64>,
    ) -> Result<usize, BrokerError> {
        self.chaos("push")?;
        self.inner.push(key, value, max_len, expires_at_ms)
    }

    fn drain(&self, key: &str, now_ms: u64) -> Result<Vec<Vec<u8>>, BrokerError> {
        self.chaos("drain")?;
        self.inner.drain(key, now_ms)
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        self.chaos("publish")?;
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        self.chaos("subscribe")?;
        self.inner.subscribe(subscriber, pattern)
    }

    fn unsubscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        self.chaos("unsubscribe")?;
        self.inner.unsubscribe(subscriber, pattern)
    }

    fn poll(&self, subscriber: &str, max: usize) -> Result<Vec<Published>, BrokerError> {
        self.chaos("poll")?;
        self.inner.poll(subscriber, max)
    }

    fn ping(&self) -> Result<(), BrokerError> {
        self.chaos("ping")?;
        self.inner.ping()
    }
}
