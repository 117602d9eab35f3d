//! Ephemeral state payloads: typing, presence, voice.

use serde::{Deserialize, Serialize};

use crate::types::PresenceStatus;

/// `typing:start` / `typing:stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingRequest {
    /// Room the user is typing in
    pub room_id: String,
}

/// Typing state broadcast to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUpdate {
    /// Room
    pub room_id: String,
    /// Typing user
    pub user_id: String,
    /// False when the user stopped or the indicator expired
    pub typing: bool,
}

/// Client sets its own presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSet {
    /// New status
    pub status: PresenceStatus,
}

/// Presence broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// User whose presence changed
    pub user_id: String,
    /// Status as others should see it
    pub status: PresenceStatus,
}

/// `voice:state`. Clients leave `user_id` empty; the server fills it in when
/// broadcasting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    /// Voice or video room
    pub room_id: String,
    /// Member the state belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Microphone muted
    pub muted: bool,
    /// Audio output muted
    pub deafened: bool,
    /// Currently speaking
    pub speaking: bool,
}
