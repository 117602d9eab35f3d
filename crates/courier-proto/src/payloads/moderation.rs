//! Moderation payloads.

use serde::{Deserialize, Serialize};

use crate::types::ModerationKind;

/// `moderation:kick|mute|ban|unmute|unban`. The opcode selects the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRequest {
    /// Room the action applies to
    pub room_id: String,
    /// User being moderated
    pub target_user_id: String,
    /// Reason shown to the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Mute duration; indefinite when omitted. Ignored for kick and ban.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// `moderation:action`, broadcast after a moderation request succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationAction {
    /// What was done
    pub kind: ModerationKind,
    /// Room
    pub room_id: String,
    /// Moderated user
    pub target_user_id: String,
    /// Acting moderator
    pub moderator_id: String,
    /// Reason, if given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Mute duration, if timed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
