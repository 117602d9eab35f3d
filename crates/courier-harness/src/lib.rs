//! Deterministic simulation harness for Courier.
//!
//! [`SimEnv`] supplies virtual time and a seeded RNG; [`SimCluster`] runs
//! several server drivers over one shared broker and executes their actions
//! against in-memory clients. Together they make multi-instance scenarios
//! (cross-instance delivery, moderation, reconnection, crashes) reproducible
//! from a seed.
//!
//! # Invariant Testing
//!
//! The [`invariants`] module checks properties that must hold after every
//! step, such as connection ceilings and the dead-letter bound. Use
//! [`InvariantRegistry::standard()`] for the common set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod cluster;
pub mod invariants;
pub mod sim_env;

pub use cluster::{SimCluster, SimError, SimSocket};
pub use invariants::{
    ClusterSnapshot, Invariant, InvariantRegistry, InvariantResult, Violation,
};
pub use sim_env::{SIM_EPOCH_MS, SimEnv, SimInstant};
