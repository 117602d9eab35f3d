//! Error types for the core state machines.
//!
//! Each error knows whether it is transient (the caller should back off and
//! retry) and how it is presented to a client as an [`ErrorPayload`].

use std::time::Duration;

use courier_proto::ErrorPayload;
use thiserror::Error;

use crate::message::MessageStatus;

/// Errors from the message delivery queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Malformed message; rejected before entering a lane, never retried
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Delivery breaker is open
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Time until the breaker admits a probe
        retry_after: Duration,
    },

    /// Sender exceeded its rate limit
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Time until sends are accepted again
        retry_after: Duration,
    },

    /// No ack arrived within the delivery window
    #[error("delivery timeout for message {message_id}")]
    DeliveryTimeout {
        /// Message that timed out
        message_id: String,
    },

    /// Status change not permitted
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status
        from: MessageStatus,
        /// Requested status
        to: MessageStatus,
    },

    /// Durable store unavailable or failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Message record could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl QueueError {
    /// Returns true if the caller should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RateLimited { .. }
                | Self::DeliveryTimeout { .. }
                | Self::Storage(_)
        )
    }

    /// Client-facing form.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::InvalidMessage(msg) => ErrorPayload::invalid_message(msg.clone()),
            Self::CircuitOpen { retry_after } => {
                ErrorPayload::new(ErrorPayload::CIRCUIT_OPEN, self.to_string())
                    .with_retry_after(retry_after.as_millis() as u64)
            },
            Self::RateLimited { retry_after } => {
                ErrorPayload::rate_limited(retry_after.as_millis() as u64)
            },
            Self::DeliveryTimeout { .. } => {
                ErrorPayload::new(ErrorPayload::DELIVERY_TIMEOUT, self.to_string())
            },
            Self::InvalidTransition { .. } | Self::Storage(_) | Self::Codec(_) => {
                ErrorPayload::internal(self.to_string())
            },
        }
    }
}

/// Connection admission refusals.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Too many new connections from one address
    #[error("too many connections from {addr}, retry after {retry_after:?}")]
    RateLimited {
        /// Remote address
        addr: String,
        /// Time until the window resets
        retry_after: Duration,
    },

    /// A connection ceiling was reached
    #[error("{scope} connection limit of {limit} reached")]
    CapacityExceeded {
        /// Which ceiling: `global`, `user` or `ip`
        scope: &'static str,
        /// The ceiling
        limit: usize,
    },
}

impl AdmissionError {
    /// Returns true if the caller should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Client-facing form.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::RateLimited { retry_after, .. } => {
                ErrorPayload::rate_limited(retry_after.as_millis() as u64)
            },
            Self::CapacityExceeded { .. } => {
                ErrorPayload::new(ErrorPayload::CAPACITY_EXCEEDED, self.to_string())
            },
        }
    }
}

/// Session errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Restore attempted by a user who does not own the session
    #[error("session {session_id} belongs to another user")]
    UserMismatch {
        /// Session that was presented
        session_id: String,
    },

    /// Reconnection probes exhausted. Fatal for the session.
    #[error("session {session_id} failed after {attempts} reconnection attempts")]
    Failed {
        /// Failed session
        session_id: String,
        /// Probes made
        attempts: u32,
    },

    /// First frame on a connection was not a handshake
    #[error("expected handshake, got opcode {0:#06x}")]
    HandshakeRequired(u16),

    /// Client speaks an unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Session record could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl SessionError {
    /// Client-facing form.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::UserMismatch { .. } => ErrorPayload::forbidden(self.to_string()),
            Self::Failed { .. } => ErrorPayload::new(ErrorPayload::SESSION_FAILED, self.to_string()),
            Self::HandshakeRequired(_) | Self::UnsupportedVersion(_) => {
                ErrorPayload::protocol(self.to_string())
            },
            Self::Codec(_) => ErrorPayload::internal(self.to_string()),
        }
    }
}
