//! Backoff schedules.
//!
//! Two schedules live here: the capped exponential reconnection backoff with
//! jitter used by the connection monitor, and the uncapped doubling used for
//! message redelivery.

use std::time::Duration;

/// Capped exponential backoff with jitter.
///
/// `delay(n) = min(initial * multiplier^(n-1), max) * U(0.5, 1.0)` for attempt
/// `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt (before jitter)
    pub initial_delay: Duration,
    /// Growth factor per attempt, at least 1.0
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for `attempt` (1-based). Attempt 0 is treated as 1.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled.is_nan() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Jittered delay for `attempt`. `unit` is a uniform sample in `[0, 1)`,
    /// mapped onto the `[0.5, 1.0)` jitter factor.
    #[must_use]
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let factor = 0.5 + 0.5 * unit.clamp(0.0, 1.0);
        self.base_delay(attempt).mul_f64(factor)
    }

    /// Whether `attempt` is past the allowed number of attempts.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Redelivery delay after `attempts` failed deliveries:
/// `retry_delay * 2^(attempts-1)`, saturating.
#[must_use]
pub fn retry_delay(retry_delay: Duration, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(31);
    retry_delay.saturating_mul(1u32 << shift)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let policy = BackoffPolicy::default();
        let base = policy.base_delay(3);
        assert_eq!(policy.delay(3, 0.0), base / 2);
        assert!(policy.delay(3, 0.999) < base);
        assert!(policy.delay(3, 0.999) > base.mul_f64(0.99));
    }

    #[test]
    fn retry_delay_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(500));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(retry_delay(base, 4), Duration::from_millis(4000));
        assert_eq!(retry_delay(base, 0), Duration::from_millis(500));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn base_delay_monotonic_and_capped(
            initial_ms in 1u64..10_000,
            multiplier in 1.0f64..4.0,
            max_ms in 10_000u64..600_000,
            max_attempts in 1u32..64,
        ) {
            let policy = BackoffPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                multiplier,
                max_delay: Duration::from_millis(max_ms),
                max_attempts,
            };

            let mut previous = Duration::ZERO;
            for attempt in 1..=max_attempts {
                let delay = policy.base_delay(attempt);
                prop_assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
            prop_assert!(policy.exhausted(max_attempts + 1));
            prop_assert!(!policy.exhausted(max_attempts));
        }

        #[test]
        fn jittered_delay_bounded(attempt in 1u32..20, unit in 0.0f64..1.0) {
            let policy = BackoffPolicy::default();
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt, unit);
            prop_assert!(delay <= base);
            prop_assert!(delay >= base / 2);
        }
    }
}
