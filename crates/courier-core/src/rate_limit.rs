//! Fixed-window rate limiters.
//!
//! [`SendRateLimiter`] guards `queue:send` per user: a steady window plus a
//! short burst window whose overflow imposes a penalty. [`AdmissionLimiter`]
//! guards new connections per remote address with a hard block until the
//! window resets.

use std::{collections::HashMap, time::Duration};

use crate::env::Instant;

#[derive(Debug, Clone, Copy)]
struct Window<I> {
    started: I,
    count: u32,
}

impl<I: Instant> Window<I> {
    fn new(now: I) -> Self {
        Self { started: now, count: 0 }
    }

    /// Roll over if `length` has elapsed, then count one hit.
    fn hit(&mut self, now: I, length: Duration) -> u32 {
        if now - self.started >= length {
            *self = Self::new(now);
        }
        self.count += 1;
        self.count
    }

    fn remaining(&self, now: I, length: Duration) -> Duration {
        length.saturating_sub(now - self.started)
    }
}

/// Per-user send limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimits {
    /// Steady window length
    pub window: Duration,
    /// Sends allowed per steady window
    pub max_per_window: u32,
    /// Burst window length
    pub burst_window: Duration,
    /// Sends allowed per burst window; exceeding it starts a penalty
    pub burst_limit: u32,
    /// Penalty length
    pub penalty: Duration,
}

impl Default for SendLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 120,
            burst_window: Duration::from_secs(1),
            burst_limit: 10,
            penalty: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct UserState<I> {
    steady: Window<I>,
    burst: Window<I>,
    penalty_until: Option<I>,
}

/// Per-user `queue:send` limiter.
///
/// # Invariants
///
/// - While a penalty is active every send is rejected, regardless of the
///   remaining window capacity.
/// - Rejected sends do not consume window capacity.
#[derive(Debug, Clone)]
pub struct SendRateLimiter<I> {
    limits: SendLimits,
    users: HashMap<String, UserState<I>>,
}

impl<I: Instant> SendRateLimiter<I> {
    /// New limiter.
    #[must_use]
    pub fn new(limits: SendLimits) -> Self {
        Self { limits, users: HashMap::new() }
    }

    /// Count one send by `user_id`. `Err(retry_after)` if rejected.
    pub fn check(&mut self, user_id: &str, now: I) -> Result<(), Duration> {
        let limits = self.limits;
        let state = self.users.entry(user_id.to_string()).or_insert_with(|| UserState {
            steady: Window::new(now),
            burst: Window::new(now),
            penalty_until: None,
        });

        if let Some(until) = state.penalty_until {
            if now < until {
                return Err(until - now);
            }
            state.penalty_until = None;
        }

        if state.burst.hit(now, limits.burst_window) > limits.burst_limit {
            state.burst.count -= 1;
            let until = now + limits.penalty;
            state.penalty_until = Some(until);
            return Err(limits.penalty);
        }

        if state.steady.hit(now, limits.window) > limits.max_per_window {
            state.steady.count -= 1;
            state.burst.count -= 1;
            return Err(state.steady.remaining(now, limits.window));
        }

        Ok(())
    }

    /// Drop state for users idle for longer than both windows and with no
    /// active penalty.
    pub fn prune(&mut self, now: I) {
        let horizon = self.limits.window.max(self.limits.burst_window);
        self.users.retain(|_, s| {
            now - s.steady.started < horizon || s.penalty_until.is_some_and(|until| now < until)
        });
    }

    /// Tracked users.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.users.len()
    }
}

/// Per-address connection admission limiter.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter<I> {
    window: Duration,
    max_per_window: u32,
    addrs: HashMap<String, Window<I>>,
}

impl<I: Instant> AdmissionLimiter<I> {
    /// Allow `max_per_window` new connections per `window` per address.
    #[must_use]
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self { window, max_per_window, addrs: HashMap::new() }
    }

    /// Count one connection attempt from `addr`. `Err(retry_after)` until the
    /// window resets.
    pub fn check(&mut self, addr: &str, now: I) -> Result<(), Duration> {
        let window = self.addrs.entry(addr.to_string()).or_insert_with(|| Window::new(now));
        if window.hit(now, self.window) > self.max_per_window {
            return Err(window.remaining(now, self.window));
        }
        Ok(())
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&mut self, now: I) {
        let length = self.window;
        self.addrs.retain(|_, w| now - w.started < length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn limits() -> SendLimits {
        SendLimits {
            window: ms(60_000),
            max_per_window: 100,
            burst_window: ms(1_000),
            burst_limit: 5,
            penalty: ms(10_000),
        }
    }

    #[test]
    fn burst_overflow_starts_penalty() {
        let mut limiter = SendRateLimiter::new(limits());
        for i in 0..5 {
            assert!(limiter.check("u", ms(i)).is_ok());
        }
        assert_eq!(limiter.check("u", ms(10)), Err(ms(10_000)));
        assert_eq!(limiter.check("u", ms(20)), Err(ms(9_990)));

        // Penalty ends and the burst window has long rolled over
        assert!(limiter.check("u", ms(10_010)).is_ok());
    }

    #[test]
    fn steady_window_rejects_without_penalty() {
        let mut limiter = SendRateLimiter::new(SendLimits { max_per_window: 3, ..limits() });
        for i in 0..3 {
            assert!(limiter.check("u", ms(i * 2_000)).is_ok());
        }
        assert_eq!(limiter.check("u", ms(6_000)), Err(ms(54_000)));
        assert_eq!(limiter.check("u", ms(8_000)), Err(ms(52_000)));
        assert!(limiter.check("u", ms(60_000)).is_ok());
    }

    #[test]
    fn users_are_independent() {
        let mut limiter = SendRateLimiter::new(limits());
        for i in 0..6 {
            let _ = limiter.check("noisy", ms(i));
        }
        assert!(limiter.check("quiet", ms(10)).is_ok());
    }

    #[test]
    fn prune_keeps_penalized_users() {
        let mut limiter = SendRateLimiter::new(limits());
        for i in 0..6 {
            let _ = limiter.check("noisy", ms(i));
        }
        assert!(limiter.check("idle", ms(0)).is_ok());
        limiter.prune(ms(60_001));
        assert_eq!(limiter.tracked(), 0);

        for i in 0..6 {
            let _ = limiter.check("noisy", ms(70_000 + i));
        }
        limiter.prune(ms(70_010));
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn admission_hard_block_until_reset() {
        let mut limiter = AdmissionLimiter::new(ms(60_000), 10);
        for i in 0..10 {
            assert!(limiter.check("10.0.0.1", ms(i)).is_ok());
        }
        assert_eq!(limiter.check("10.0.0.1", ms(30_000)), Err(ms(30_000)));
        assert!(limiter.check("10.0.0.2", ms(30_000)).is_ok());
        assert!(limiter.check("10.0.0.1", ms(60_000)).is_ok());
    }
}
