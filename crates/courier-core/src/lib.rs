//! Courier core.
//!
//! Pure state machines shared by the server components. Nothing here performs
//! I/O or reads a clock: callers pass `now` in and act on the returned values,
//! which keeps every component deterministic under simulation.
//!
//! - [`env`]: time and randomness abstraction
//! - [`breaker`] and [`backoff`]: failure handling primitives
//! - [`timer`]: cancellable deadline queue
//! - [`session`] and [`connection`]: session records and heartbeat monitoring
//! - [`message`]: queued message model and status transitions
//! - [`rate_limit`] and [`dedupe`]: admission and duplicate suppression

pub mod backoff;
pub mod breaker;
pub mod connection;
pub mod dedupe;
pub mod env;
pub mod error;
pub mod message;
pub mod rate_limit;
pub mod session;
pub mod timer;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use connection::{ConnectionMonitor, LinkState, MonitorAction};
pub use dedupe::RecentSet;
pub use env::{Environment, Instant};
pub use error::{AdmissionError, QueueError, SessionError};
pub use message::{DeliveryLimits, DeliveryOptions, MessageStatus, Metadata, QueueMessage, Routing};
pub use session::{DegradationLevel, Session, SessionState};
pub use timer::TimerWheel;
