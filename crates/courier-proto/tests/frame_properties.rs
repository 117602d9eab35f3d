//! Property-based tests for frame decoding robustness.
//!
//! Frames arrive from untrusted clients, so decoding must reject every
//! malformed input with an error and never panic.

use courier_proto::{
    Frame, FrameHeader, Opcode, Payload, ProtocolError,
    payloads::{presence::TypingRequest, room::RoomJoin},
};
use proptest::prelude::*;

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Hello),
        Just(Opcode::Goodbye),
        Just(Opcode::Ping),
        Just(Opcode::Pong),
        Just(Opcode::QueueSend),
        Just(Opcode::MessageAck),
        Just(Opcode::RoomCreate),
        Just(Opcode::RoomJoin),
        Just(Opcode::TypingStart),
        Just(Opcode::VoiceState),
        Just(Opcode::Ban),
        Just(Opcode::Error),
    ]
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (arbitrary_opcode(), any::<u32>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
        |(opcode, request_id, payload)| {
            let mut header = FrameHeader::new(opcode);
            header.set_request_id(request_id);
            Frame::new(header, payload)
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(frame) = Frame::decode(&bytes) {
            let _ = Payload::from_frame(&frame);
        }
    }

    #[test]
    fn random_payload_for_known_opcode_never_panics(
        opcode in arbitrary_opcode(),
        bytes in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let _ = Payload::decode(opcode, &bytes);
    }

    #[test]
    fn every_strict_prefix_is_rejected(frame in arbitrary_frame(), cut in any::<prop::sample::Index>()) {
        let wire = frame.to_vec().expect("encode");
        let len = cut.index(wire.len());
        prop_assert!(Frame::decode(&wire[..len]).is_err());
    }

    #[test]
    fn back_to_back_frames_split_cleanly(a in arbitrary_frame(), b in arbitrary_frame()) {
        let mut wire = a.to_vec().expect("encode");
        wire.extend_from_slice(&b.to_vec().expect("encode"));

        let first = Frame::decode(&wire).expect("decode first");
        let second = Frame::decode(&wire[first.encoded_len()..]).expect("decode second");
        prop_assert_eq!(first, a);
        prop_assert_eq!(second, b);
    }
}

#[test]
fn request_id_survives_payload_encoding() {
    let mut header = FrameHeader::new(Opcode::RoomJoin);
    header.set_request_id(42);

    let frame = Payload::RoomJoin(RoomJoin { room_id: "general".into(), password: None })
        .into_frame(header)
        .expect("encode");

    let decoded = Frame::decode(&frame.to_vec().expect("encode")).expect("decode");
    assert_eq!(decoded.header.request_id(), 42);
    assert_eq!(decoded.header.opcode_enum(), Some(Opcode::RoomJoin));
}

#[test]
fn into_frame_overrides_header_opcode() {
    let frame = Payload::TypingStart(TypingRequest { room_id: "r".into() })
        .into_frame(FrameHeader::new(Opcode::Error))
        .expect("encode");
    assert_eq!(frame.header.opcode_enum(), Some(Opcode::TypingStart));
}

#[test]
fn foreign_magic_is_rejected() {
    let mut wire = Payload::Error(courier_proto::ErrorPayload::internal("x"))
        .to_frame()
        .expect("encode")
        .to_vec()
        .expect("encode");
    wire[0] = b'X';
    assert!(matches!(Frame::decode(&wire), Err(ProtocolError::InvalidMagic(_))));
}
