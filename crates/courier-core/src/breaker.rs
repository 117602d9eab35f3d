//! Circuit breaker.
//!
//! Shared by the broker adapter and the delivery queue. The breaker is a pure
//! value: callers pass `now` into every method, so there is no hidden clock and
//! transitions are deterministic.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────> Open
//!     ^                                  │ recovery_timeout elapsed
//!     │ probe ok                         v
//!     └──────────────────────────── HalfOpen ──probe failed──> Open
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Operations flow normally
    Closed,
    /// Operations are rejected until the recovery timeout elapses
    Open,
    /// One probe operation is allowed to decide the next state
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub threshold: u32,
    /// Time spent open before a probe is allowed
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

/// Circuit breaker over a monotonic instant type `I`.
///
/// # Invariants
///
/// - Closed to Open only once `failure_count >= threshold`.
/// - Open to HalfOpen only after `recovery_timeout` has elapsed since opening.
/// - While HalfOpen, at most one probe is admitted. Its outcome closes or
///   reopens the breaker; reopening restarts the recovery timeout.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<I> {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<I>,
    opened_at: Option<I>,
    probe_in_flight: bool,
    times_opened: u64,
}

impl<I: Instant> CircuitBreaker<I> {
    /// New breaker in the closed state.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        debug_assert!(config.threshold > 0, "breaker threshold must be positive");
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
            times_opened: 0,
        }
    }

    /// State as of `now`, advancing Open to HalfOpen if the recovery timeout
    /// has elapsed.
    pub fn state(&mut self, now: I) -> BreakerState {
        if self.state == BreakerState::Open
            && let Some(opened) = self.opened_at
            && now - opened >= self.config.recovery_timeout
        {
            self.state = BreakerState::HalfOpen;
            self.probe_in_flight = false;
        }
        self.state
    }

    /// State without advancing time. Use for reporting only.
    #[must_use]
    pub fn current_state(&self) -> BreakerState {
        self.state
    }

    /// Whether an operation may proceed at `now`, without admitting a probe.
    pub fn is_open(&mut self, now: I) -> bool {
        match self.state(now) {
            BreakerState::Closed => false,
            BreakerState::Open => true,
            BreakerState::HalfOpen => self.probe_in_flight,
        }
    }

    /// Ask to perform one operation.
    ///
    /// Returns `Err(retry_after)` when rejected. In the half-open state the
    /// first caller becomes the probe and later callers are rejected until the
    /// probe outcome is recorded.
    pub fn try_acquire(&mut self, now: I) -> Result<(), Duration> {
        match self.state(now) {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(self.remaining_open(now)),
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Err(self.config.recovery_timeout)
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            },
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self, now: I) {
        match self.state(now) {
            BreakerState::Closed => self.failure_count = 0,
            BreakerState::HalfOpen => self.close(),
            BreakerState::Open => {},
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, now: I) {
        self.last_failure_at = Some(now);
        match self.state(now) {
            BreakerState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.config.threshold {
                    self.open(now);
                }
            },
            BreakerState::HalfOpen => self.open(now),
            BreakerState::Open => {},
        }
    }

    /// Consecutive failures counted while closed.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time of the most recent failure.
    #[must_use]
    pub fn last_failure_at(&self) -> Option<I> {
        self.last_failure_at
    }

    /// How many times the breaker has opened.
    #[must_use]
    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    /// Time until a probe will be admitted, zero if not open.
    #[must_use]
    pub fn remaining_open(&self, now: I) -> Duration {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened)) => {
                self.config.recovery_timeout.saturating_sub(now - opened)
            },
            _ => Duration::ZERO,
        }
    }

    fn open(&mut self, now: I) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.times_opened += 1;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    // Duration doubles as a monotonic instant in tests
    type T = Duration;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker<T> {
        CircuitBreaker::new(BreakerConfig {
            threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        })
    }

    fn ms(v: u64) -> T {
        Duration::from_millis(v)
    }

    #[test]
    fn opens_at_threshold() {
        let mut b = breaker(3, 1000);
        b.record_failure(ms(0));
        b.record_failure(ms(1));
        assert_eq!(b.state(ms(2)), BreakerState::Closed);
        b.record_failure(ms(2));
        assert_eq!(b.state(ms(3)), BreakerState::Open);
        assert_eq!(b.try_acquire(ms(3)), Err(ms(999)));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut b = breaker(3, 1000);
        b.record_failure(ms(0));
        b.record_failure(ms(1));
        b.record_success(ms(2));
        b.record_failure(ms(3));
        b.record_failure(ms(4));
        assert_eq!(b.state(ms(5)), BreakerState::Closed);
    }

    #[test]
    fn probe_success_closes() {
        let mut b = breaker(1, 100);
        b.record_failure(ms(0));
        assert!(b.try_acquire(ms(100)).is_ok());
        b.record_success(ms(101));
        assert_eq!(b.state(ms(101)), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_timeout() {
        let mut b = breaker(1, 100);
        b.record_failure(ms(0));
        assert!(b.try_acquire(ms(150)).is_ok());
        b.record_failure(ms(160));
        assert_eq!(b.state(ms(200)), BreakerState::Open);
        assert_eq!(b.state(ms(259)), BreakerState::Open);
        assert_eq!(b.state(ms(260)), BreakerState::HalfOpen);
        assert_eq!(b.times_opened(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn exactly_one_probe_after_recovery(
            threshold in 1u32..10,
            recovery_ms in 1u64..10_000,
            callers in 2usize..20,
        ) {
            let mut b = breaker(threshold, recovery_ms);
            for i in 0..threshold {
                prop_assert_eq!(b.current_state(), BreakerState::Closed);
                b.record_failure(ms(u64::from(i)));
            }
            let opened = u64::from(threshold - 1);
            prop_assert_eq!(b.state(ms(opened)), BreakerState::Open);

            // Nothing gets through before the timeout
            prop_assert!(b.try_acquire(ms(opened + recovery_ms - 1)).is_err());

            let at = ms(opened + recovery_ms);
            let admitted = (0..callers).filter(|_| b.try_acquire(at).is_ok()).count();
            prop_assert_eq!(admitted, 1);
        }
    }
}
