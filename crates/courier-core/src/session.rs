//! Session records.
//!
//! A session is the logical identity behind a connection. It outlives the
//! physical socket: on disconnect the record is kept (locally and in the
//! broker under `session:<id>`) so a reconnecting client can restore it.
//! Timestamps are wall-clock milliseconds because the record is shared across
//! instances.

use std::collections::BTreeSet;

use courier_proto::DeviceType;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Transport-health classification. Distinct from user-facing presence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// Heartbeats answered on time
    #[default]
    None,
    /// One heartbeat interval missed
    Partial,
    /// Two intervals missed; reconnection under way
    Severe,
}

/// Mutable liveness flags of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// A socket is currently attached
    pub is_active: bool,
    /// Reconnection probes are in progress
    pub is_reconnecting: bool,
    /// Probes made in the current reconnection episode
    pub reconnect_attempts: u32,
    /// Current transport health
    pub degradation_level: DegradationLevel,
}

/// One logical client session.
///
/// # Invariants
///
/// - `session_id` never changes, including across restores.
/// - `reconnect_count` increases by exactly one per restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Stable identifier
    pub session_id: String,
    /// Owning user
    pub user_id: String,
    /// Device the session belongs to
    pub device_id: String,
    /// Device class
    pub device_type: DeviceType,
    /// First connect time (Unix millis)
    pub connected_at_ms: u64,
    /// Last inbound activity (Unix millis)
    pub last_seen_ms: u64,
    /// Last heartbeat reply (Unix millis)
    pub last_heartbeat_ms: u64,
    /// Number of successful restores
    pub reconnect_count: u32,
    /// Rooms the session had joined
    pub rooms: BTreeSet<String>,
    /// Liveness flags
    pub state: SessionState,
}

impl Session {
    /// Fresh, active session.
    #[must_use]
    pub fn new(
        session_id: String,
        user_id: String,
        device_id: String,
        device_type: DeviceType,
        now_ms: u64,
    ) -> Self {
        Self {
            session_id,
            user_id,
            device_id,
            device_type,
            connected_at_ms: now_ms,
            last_seen_ms: now_ms,
            last_heartbeat_ms: now_ms,
            reconnect_count: 0,
            rooms: BTreeSet::new(),
            state: SessionState { is_active: true, ..SessionState::default() },
        }
    }

    /// Reattach to a new connection.
    ///
    /// # Errors
    ///
    /// - `UserMismatch` if `user_id` does not own the session
    pub fn restore(&mut self, user_id: &str, now_ms: u64) -> Result<(), SessionError> {
        if self.user_id != user_id {
            return Err(SessionError::UserMismatch { session_id: self.session_id.clone() });
        }
        self.reconnect_count += 1;
        self.last_seen_ms = now_ms;
        self.last_heartbeat_ms = now_ms;
        self.state = SessionState { is_active: true, ..SessionState::default() };
        Ok(())
    }

    /// Record inbound activity.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    /// Record a heartbeat reply; clears degradation.
    pub fn record_heartbeat(&mut self, now_ms: u64) {
        self.touch(now_ms);
        self.last_heartbeat_ms = self.last_heartbeat_ms.max(now_ms);
        self.state.degradation_level = DegradationLevel::None;
        self.state.is_reconnecting = false;
        self.state.reconnect_attempts = 0;
    }

    /// Socket detached; record kept for restore.
    pub fn mark_inactive(&mut self) {
        self.state.is_active = false;
        self.state.is_reconnecting = false;
    }

    /// Serialize for the broker.
    ///
    /// # Errors
    ///
    /// - `Codec` if CBOR serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| SessionError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a broker record.
    ///
    /// # Errors
    ///
    /// - `Codec` if the bytes are not a session
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        ciborium::de::from_reader(bytes).map_err(|e| SessionError::Codec(e.to_string()))
    }

    /// Broker key for a session id.
    #[must_use]
    pub fn key(session_id: &str) -> String {
        format!("session:{session_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1".into(), "alice".into(), "phone".into(), DeviceType::Mobile, 1_000)
    }

    #[test]
    fn restore_increments_count_and_keeps_rooms() {
        let mut s = session();
        s.rooms.insert("general".into());
        s.mark_inactive();

        s.restore("alice", 5_000).expect("same user");
        assert_eq!(s.reconnect_count, 1);
        assert_eq!(s.session_id, "s1");
        assert!(s.state.is_active);
        assert!(s.rooms.contains("general"));
    }

    #[test]
    fn restore_rejects_other_user() {
        let mut s = session();
        assert!(matches!(s.restore("mallory", 2_000), Err(SessionError::UserMismatch { .. })));
        assert_eq!(s.reconnect_count, 0);
    }

    #[test]
    fn heartbeat_clears_degradation() {
        let mut s = session();
        s.state.degradation_level = DegradationLevel::Severe;
        s.state.is_reconnecting = true;
        s.record_heartbeat(3_000);
        assert_eq!(s.state.degradation_level, DegradationLevel::None);
        assert!(!s.state.is_reconnecting);
        assert_eq!(s.last_heartbeat_ms, 3_000);
    }

    #[test]
    fn cbor_round_trip() {
        let mut s = session();
        s.rooms.insert("r1".into());
        let decoded = Session::from_bytes(&s.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded, s);
    }
}
