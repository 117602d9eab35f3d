//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary; payloads use CBOR so fields can be added
//! without breaking older peers. Only the inner struct is serialized: the
//! header opcode already identifies the variant, so a mismatched
//! opcode/payload pair simply fails to decode.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness).

pub mod moderation;
pub mod presence;
pub mod queue;
pub mod room;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session
    /// Client handshake
    Hello(session::Hello),
    /// Handshake accepted
    ConnectionEstablished(session::ConnectionEstablished),
    /// Graceful close
    Goodbye(session::Goodbye),
    /// Heartbeat probe
    Ping(session::Heartbeat),
    /// Heartbeat reply
    Pong(session::Heartbeat),

    // Queue
    /// Route a message
    QueueSend(queue::QueueSend),
    /// Message admitted
    QueueEnqueued(queue::QueueEnqueued),
    /// Message rejected
    QueueError(ErrorPayload),
    /// Routed message pushed to a socket
    MessageDeliver(queue::Delivery),
    /// Delivery acknowledgement
    MessageAck(queue::MessageAck),
    /// Delivery abandoned
    MessageFailed(queue::MessageFailed),

    // Rooms
    /// Create a room
    RoomCreate(room::RoomCreate),
    /// Join a room
    RoomJoin(room::RoomJoin),
    /// Join accepted
    RoomJoined(room::RoomJoined),
    /// Leave a room
    RoomLeave(room::RoomLeave),
    /// Room operation rejected
    RoomError(room::RoomError),
    /// Member joined or left
    MemberUpdate(room::MemberUpdate),

    // Presence
    /// Started typing
    TypingStart(presence::TypingRequest),
    /// Stopped typing
    TypingStop(presence::TypingRequest),
    /// Typing broadcast
    TypingUpdate(presence::TypingUpdate),
    /// Set own presence
    PresenceSet(presence::PresenceSet),
    /// Presence broadcast
    PresenceUpdate(presence::PresenceUpdate),
    /// Voice state change
    VoiceState(presence::VoiceState),

    // Moderation
    /// Kick a member
    Kick(moderation::ModerationRequest),
    /// Mute a member
    Mute(moderation::ModerationRequest),
    /// Ban a member
    Ban(moderation::ModerationRequest),
    /// Moderation broadcast
    ModerationAction(moderation::ModerationAction),
    /// Lift a mute
    Unmute(moderation::ModerationRequest),
    /// Lift a ban
    Unban(moderation::ModerationRequest),

    /// Generic error
    Error(ErrorPayload),
}

/// Structured error sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code
    pub code: u16,
    /// Human-readable message
    pub message: String,
    /// How long the client should wait before retrying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorPayload {
    /// Malformed or incomplete message.
    pub const INVALID_MESSAGE: u16 = 0x0001;
    /// Caller lacks permission.
    pub const FORBIDDEN: u16 = 0x0002;
    /// Caller is sending too fast.
    pub const RATE_LIMITED: u16 = 0x0003;
    /// Delivery is temporarily unavailable.
    pub const CIRCUIT_OPEN: u16 = 0x0004;
    /// No ack within the delivery window.
    pub const DELIVERY_TIMEOUT: u16 = 0x0005;
    /// Connection or session limits reached.
    pub const CAPACITY_EXCEEDED: u16 = 0x0006;
    /// Session could not be recovered.
    pub const SESSION_FAILED: u16 = 0x0007;
    /// Room does not exist.
    pub const ROOM_NOT_FOUND: u16 = 0x0008;
    /// Frame-level protocol violation.
    pub const PROTOCOL: u16 = 0x0009;
    /// Server-side failure.
    pub const INTERNAL: u16 = 0x00FF;

    /// Build an error with an explicit code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_ms: None }
    }

    /// Attach a retry hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Malformed input.
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::new(Self::INVALID_MESSAGE, msg)
    }

    /// Authorization failure.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(Self::FORBIDDEN, msg)
    }

    /// Rate limited, retry after `retry_after_ms`.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(Self::RATE_LIMITED, "rate limit exceeded").with_retry_after(retry_after_ms)
    }

    /// Frame-level protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL, msg)
    }

    /// Server-side failure.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, msg)
    }
}

fn write_cbor<T: Serialize>(value: &T, dst: &mut impl BufMut) -> Result<()> {
    ciborium::ser::into_writer(value, dst.writer())
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
}

fn read_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Opcode for this payload.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::ConnectionEstablished(_) => Opcode::ConnectionEstablished,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Ping(_) => Opcode::Ping,
            Self::Pong(_) => Opcode::Pong,
            Self::QueueSend(_) => Opcode::QueueSend,
            Self::QueueEnqueued(_) => Opcode::QueueEnqueued,
            Self::QueueError(_) => Opcode::QueueError,
            Self::MessageDeliver(_) => Opcode::MessageDeliver,
            Self::MessageAck(_) => Opcode::MessageAck,
            Self::MessageFailed(_) => Opcode::MessageFailed,
            Self::RoomCreate(_) => Opcode::RoomCreate,
            Self::RoomJoin(_) => Opcode::RoomJoin,
            Self::RoomJoined(_) => Opcode::RoomJoined,
            Self::RoomLeave(_) => Opcode::RoomLeave,
            Self::RoomError(_) => Opcode::RoomError,
            Self::MemberUpdate(_) => Opcode::MemberUpdate,
            Self::TypingStart(_) => Opcode::TypingStart,
            Self::TypingStop(_) => Opcode::TypingStop,
            Self::TypingUpdate(_) => Opcode::TypingUpdate,
            Self::PresenceSet(_) => Opcode::PresenceSet,
            Self::PresenceUpdate(_) => Opcode::PresenceUpdate,
            Self::VoiceState(_) => Opcode::VoiceState,
            Self::Kick(_) => Opcode::Kick,
            Self::Mute(_) => Opcode::Mute,
            Self::Ban(_) => Opcode::Ban,
            Self::ModerationAction(_) => Opcode::ModerationAction,
            Self::Unmute(_) => Opcode::Unmute,
            Self::Unban(_) => Opcode::Unban,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Encode the inner struct as CBOR (no variant tag).
    ///
    /// Size limits are enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Hello(inner) => write_cbor(inner, dst),
            Self::ConnectionEstablished(inner) => write_cbor(inner, dst),
            Self::Goodbye(inner) => write_cbor(inner, dst),
            Self::Ping(inner) | Self::Pong(inner) => write_cbor(inner, dst),
            Self::QueueSend(inner) => write_cbor(inner, dst),
            Self::QueueEnqueued(inner) => write_cbor(inner, dst),
            Self::QueueError(inner) | Self::Error(inner) => write_cbor(inner, dst),
            Self::MessageDeliver(inner) => write_cbor(inner, dst),
            Self::MessageAck(inner) => write_cbor(inner, dst),
            Self::MessageFailed(inner) => write_cbor(inner, dst),
            Self::RoomCreate(inner) => write_cbor(inner, dst),
            Self::RoomJoin(inner) => write_cbor(inner, dst),
            Self::RoomJoined(inner) => write_cbor(inner, dst),
            Self::RoomLeave(inner) => write_cbor(inner, dst),
            Self::RoomError(inner) => write_cbor(inner, dst),
            Self::MemberUpdate(inner) => write_cbor(inner, dst),
            Self::TypingStart(inner) | Self::TypingStop(inner) => write_cbor(inner, dst),
            Self::TypingUpdate(inner) => write_cbor(inner, dst),
            Self::PresenceSet(inner) => write_cbor(inner, dst),
            Self::PresenceUpdate(inner) => write_cbor(inner, dst),
            Self::VoiceState(inner) => write_cbor(inner, dst),
            Self::Kick(inner)
            | Self::Mute(inner)
            | Self::Ban(inner)
            | Self::Unmute(inner)
            | Self::Unban(inner) => write_cbor(inner, dst),
            Self::ModerationAction(inner) => write_cbor(inner, dst),
        }
    }

    /// Decode payload bytes according to `opcode`.
    ///
    /// # Errors
    ///
    /// - `PayloadTooLarge` if `bytes` exceeds the protocol limit (checked
    ///   before parsing)
    /// - `CborDecode` if the bytes do not match the opcode's payload
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(match opcode {
            Opcode::Hello => Self::Hello(read_cbor(bytes)?),
            Opcode::ConnectionEstablished => Self::ConnectionEstablished(read_cbor(bytes)?),
            Opcode::Goodbye => Self::Goodbye(read_cbor(bytes)?),
            Opcode::Ping => Self::Ping(read_cbor(bytes)?),
            Opcode::Pong => Self::Pong(read_cbor(bytes)?),
            Opcode::QueueSend => Self::QueueSend(read_cbor(bytes)?),
            Opcode::QueueEnqueued => Self::QueueEnqueued(read_cbor(bytes)?),
            Opcode::QueueError => Self::QueueError(read_cbor(bytes)?),
            Opcode::MessageDeliver => Self::MessageDeliver(read_cbor(bytes)?),
            Opcode::MessageAck => Self::MessageAck(read_cbor(bytes)?),
            Opcode::MessageFailed => Self::MessageFailed(read_cbor(bytes)?),
            Opcode::RoomCreate => Self::RoomCreate(read_cbor(bytes)?),
            Opcode::RoomJoin => Self::RoomJoin(read_cbor(bytes)?),
            Opcode::RoomJoined => Self::RoomJoined(read_cbor(bytes)?),
            Opcode::RoomLeave => Self::RoomLeave(read_cbor(bytes)?),
            Opcode::RoomError => Self::RoomError(read_cbor(bytes)?),
            Opcode::MemberUpdate => Self::MemberUpdate(read_cbor(bytes)?),
            Opcode::TypingStart => Self::TypingStart(read_cbor(bytes)?),
            Opcode::TypingStop => Self::TypingStop(read_cbor(bytes)?),
            Opcode::TypingUpdate => Self::TypingUpdate(read_cbor(bytes)?),
            Opcode::PresenceSet => Self::PresenceSet(read_cbor(bytes)?),
            Opcode::PresenceUpdate => Self::PresenceUpdate(read_cbor(bytes)?),
            Opcode::VoiceState => Self::VoiceState(read_cbor(bytes)?),
            Opcode::Kick => Self::Kick(read_cbor(bytes)?),
            Opcode::Mute => Self::Mute(read_cbor(bytes)?),
            Opcode::Ban => Self::Ban(read_cbor(bytes)?),
            Opcode::ModerationAction => Self::ModerationAction(read_cbor(bytes)?),
            Opcode::Unmute => Self::Unmute(read_cbor(bytes)?),
            Opcode::Unban => Self::Unban(read_cbor(bytes)?),
            Opcode::Error => Self::Error(read_cbor(bytes)?),
        })
    }

    /// Encode into a frame, setting the header opcode and payload size.
    ///
    /// # Errors
    ///
    /// - `CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.set_opcode(self.opcode());
        Ok(Frame::new(header, buf))
    }

    /// Encode into a frame with a fresh header.
    ///
    /// # Errors
    ///
    /// - `CborEncode` if serialization fails
    pub fn to_frame(self) -> Result<Frame> {
        let header = FrameHeader::new(self.opcode());
        self.into_frame(header)
    }

    /// Decode the payload of `frame`.
    ///
    /// # Errors
    ///
    /// - `UnknownOpcode` if the header opcode is not recognized
    /// - Any error from [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceType, MessageType, Priority, TargetType};

    fn round_trip(payload: Payload) {
        let frame = payload.clone().to_frame().expect("should create frame");
        assert_eq!(frame.header.opcode_enum(), Some(payload.opcode()));
        let decoded = Payload::from_frame(&frame).expect("should parse payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Payload::Hello(session::Hello {
            version: 1,
            user_id: "alice".into(),
            device_id: "laptop".into(),
            device_type: DeviceType::Desktop,
            session_id: Some("sess-1".into()),
        }));
    }

    #[test]
    fn queue_send_with_partial_options_round_trip() {
        round_trip(Payload::QueueSend(queue::QueueSend {
            message_type: MessageType::Chat,
            payload: b"hi".to_vec(),
            to: vec!["general".into()],
            target_type: TargetType::Room,
            priority: Some(Priority::High),
            options: Some(queue::SendOptions {
                require_ack: Some(true),
                timeout_ms: Some(5_000),
                ..Default::default()
            }),
        }));
    }

    #[test]
    fn error_round_trip() {
        round_trip(Payload::Error(ErrorPayload::rate_limited(30_000)));
    }

    #[test]
    fn mismatched_opcode_fails_to_decode() {
        let frame = Payload::Ping(session::Heartbeat { timestamp_ms: 1, latency_ms: None })
            .to_frame()
            .expect("should create frame");
        let result = Payload::decode(Opcode::RoomJoin, &frame.payload);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut frame = Payload::Goodbye(session::Goodbye { reason: "bye".into() })
            .to_frame()
            .expect("should create frame");
        frame.header.set_opcode_raw(0x7777);
        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(0x7777)));
    }
}
