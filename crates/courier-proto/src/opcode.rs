//! Frame opcodes.
//!
//! Opcodes are grouped by high byte: `0x00xx` session, `0x01xx` queue,
//! `0x02xx` rooms, `0x03xx` presence, `0x04xx` moderation, `0x0Fxx` errors.

/// Operation code identifying a frame's payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake (`connection:hello`)
    Hello = 0x0001,
    /// Server accepted the handshake (`connection:established`)
    ConnectionEstablished = 0x0002,
    /// Graceful close, either direction
    Goodbye = 0x0003,
    /// `heartbeat:ping`
    Ping = 0x0004,
    /// `heartbeat:pong`
    Pong = 0x0005,

    /// `queue:send`
    QueueSend = 0x0100,
    /// `queue:enqueued`
    QueueEnqueued = 0x0101,
    /// `queue:error`
    QueueError = 0x0102,
    /// Server pushes a routed message to a socket
    MessageDeliver = 0x0103,
    /// `message:ack`
    MessageAck = 0x0104,
    /// `message:failed`, terminal delivery failure
    MessageFailed = 0x0105,

    /// `room:create`
    RoomCreate = 0x0200,
    /// `room:join`
    RoomJoin = 0x0201,
    /// `room:joined`
    RoomJoined = 0x0202,
    /// `room:leave`
    RoomLeave = 0x0203,
    /// `room:error`
    RoomError = 0x0204,
    /// Membership change broadcast to a room
    MemberUpdate = 0x0205,

    /// `typing:start`
    TypingStart = 0x0300,
    /// `typing:stop`
    TypingStop = 0x0301,
    /// Typing state broadcast to a room
    TypingUpdate = 0x0302,
    /// Client sets its own presence
    PresenceSet = 0x0303,
    /// Presence broadcast
    PresenceUpdate = 0x0304,
    /// `voice:state`, either direction
    VoiceState = 0x0305,

    /// `moderation:kick`
    Kick = 0x0400,
    /// `moderation:mute`
    Mute = 0x0401,
    /// `moderation:ban`
    Ban = 0x0402,
    /// `moderation:action` broadcast
    ModerationAction = 0x0403,
    /// `moderation:unmute`
    Unmute = 0x0404,
    /// `moderation:unban`
    Unban = 0x0405,

    /// Generic error
    Error = 0x0F00,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` for unknown opcodes.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::Hello,
            0x0002 => Self::ConnectionEstablished,
            0x0003 => Self::Goodbye,
            0x0004 => Self::Ping,
            0x0005 => Self::Pong,
            0x0100 => Self::QueueSend,
            0x0101 => Self::QueueEnqueued,
            0x0102 => Self::QueueError,
            0x0103 => Self::MessageDeliver,
            0x0104 => Self::MessageAck,
            0x0105 => Self::MessageFailed,
            0x0200 => Self::RoomCreate,
            0x0201 => Self::RoomJoin,
            0x0202 => Self::RoomJoined,
            0x0203 => Self::RoomLeave,
            0x0204 => Self::RoomError,
            0x0205 => Self::MemberUpdate,
            0x0300 => Self::TypingStart,
            0x0301 => Self::TypingStop,
            0x0302 => Self::TypingUpdate,
            0x0303 => Self::PresenceSet,
            0x0304 => Self::PresenceUpdate,
            0x0305 => Self::VoiceState,
            0x0400 => Self::Kick,
            0x0401 => Self::Mute,
            0x0402 => Self::Ban,
            0x0403 => Self::ModerationAction,
            0x0404 => Self::Unmute,
            0x0405 => Self::Unban,
            0x0F00 => Self::Error,
            _ => return None,
        })
    }

    /// Session-layer opcodes handled by the connection lifecycle, not routed.
    #[must_use]
    pub const fn is_session(self) -> bool {
        matches!(self, Self::Hello | Self::Goodbye | Self::Ping | Self::Pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip_for_every_known_value() {
        for raw in 0u16..=0x0FFF {
            if let Some(op) = Opcode::from_u16(raw) {
                assert_eq!(op.to_u16(), raw);
            }
        }
    }

    #[test]
    fn unknown_opcode_is_none() {
        assert_eq!(Opcode::from_u16(0x7777), None);
        assert_eq!(Opcode::from_u16(0), None);
    }
}
