//! Environment abstraction for deterministic testing.
//!
//! Decouples component logic from system resources (time, randomness). The
//! production server uses the OS clock and entropy; the simulation harness uses
//! a virtual clock and a seeded RNG so every run is reproducible.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic instant usable by the state machines.
///
/// Blanket-implemented for any type with the right arithmetic, so both
/// `std::time::Instant` and virtual simulation instants qualify.
pub trait Instant:
    Copy + Ord + Send + Sync + Debug + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Instant for T where
    T: Copy + Ord + Send + Sync + Debug + Sub<Output = Duration> + Add<Duration, Output = T>
{
}

/// Source of time and randomness.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `wall_clock_ms()` is Unix time in milliseconds; it may jump but is only
///   used for persisted timestamps, never for timeouts
/// - Given the same seed, a simulated environment yields the same random
///   sequence
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    type Instant: Instant;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current Unix time in milliseconds.
    fn wall_clock_ms(&self) -> u64;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random `u128`.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Uniform sample in `[0, 1)`, used for backoff jitter.
    fn random_unit(&self) -> f64 {
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Fresh 128-bit identifier rendered as 32 hex digits.
    fn new_id(&self) -> String {
        format!("{:032x}", self.random_u128())
    }
}
