//! Production environment using system time and RNG.
//!
//! `SystemEnv` reads the monotonic clock for timeouts, the system clock for
//! persisted timestamps and the OS RNG for session and message ids. Production
//! behavior is therefore non-deterministic; simulations use the harness
//! environment instead.

use courier_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. Session and message ids must be unguessable,
/// and a server that cannot produce them cannot operate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_ms(&self) -> u64 {
        // A clock set before 1970 reads as the epoch
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "time should advance");
    }

    #[test]
    fn wall_clock_is_unix_millis() {
        // 2020-09-13, comfortably in the past
        assert!(SystemEnv::new().wall_clock_ms() > 1_600_000_000_000);
    }

    #[test]
    fn ids_are_unique() {
        let env = SystemEnv::new();
        let a = env.new_id();
        let b = env.new_id();

        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
