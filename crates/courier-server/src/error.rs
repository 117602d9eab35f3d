//! Server error types.
//!
//! [`DriverError`] covers the sans-IO driver; [`ServerError`] wraps it for the
//! production runtime together with configuration and transport failures.
//! Client-caused failures never surface here: the driver answers them with an
//! error frame and carries on.

use courier_core::QueueError;
use courier_proto::ProtocolError;
use thiserror::Error;

use crate::{broker::BrokerError, config::ConfigError};

/// Errors from [`crate::ServerDriver`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// A frame produced by the server could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Durable message recovery failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Broker failure outside the degradable paths
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Errors that can occur in the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid values, missing TLS material, ...).
    ///
    /// Fatal at startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error.
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame from a peer. Fatal for that connection only.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error from the driver
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<BrokerError> for ServerError {
    fn from(err: BrokerError) -> Self {
        Self::Driver(DriverError::Broker(err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_route_through_driver() {
        let err: ServerError = BrokerError::Unavailable("down".into()).into();
        assert!(matches!(err, ServerError::Driver(DriverError::Broker(_))));
        assert_eq!(err.to_string(), "driver error: broker error: broker unavailable: down");
    }
}
