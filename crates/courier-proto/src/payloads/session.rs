//! Session management payloads: handshake, heartbeat, goodbye.

use serde::{Deserialize, Serialize};

use crate::types::DeviceType;

/// Client handshake, the first frame on every connection.
///
/// Identity fields are claims already vouched for by the authentication layer
/// in front of the server; the lifecycle manager trusts them as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the client speaks
    pub version: u8,
    /// Authenticated user identifier
    pub user_id: String,
    /// Stable per-install device identifier
    pub device_id: String,
    /// Device class
    pub device_type: DeviceType,
    /// Session to restore, if the client held one before disconnecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Server reply to a successful [`Hello`] (`connection:established`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    /// Session identifier, stable across reconnects
    pub session_id: String,
    /// True if an earlier session was restored
    pub reconnection: bool,
    /// How often the server will ping
    pub heartbeat_interval_ms: u64,
    /// Instance that accepted the connection
    pub server_id: String,
}

/// Graceful close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Free-form reason; [`Goodbye::LOGOUT`] ends the session for good
    pub reason: String,
}

impl Goodbye {
    /// Reason that destroys the session instead of keeping it restorable.
    pub const LOGOUT: &'static str = "logout";

    /// Whether this goodbye is an explicit logout.
    #[must_use]
    pub fn is_logout(&self) -> bool {
        self.reason == Self::LOGOUT
    }
}

/// `heartbeat:ping` / `heartbeat:pong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's wall clock at send time (Unix millis)
    pub timestamp_ms: u64,
    /// Round-trip estimate measured by the sender, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}
