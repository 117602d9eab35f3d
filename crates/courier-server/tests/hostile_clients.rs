//! Hostile and malformed client traffic.
//!
//! Garbage payloads under valid headers must be answered with error frames
//! or a closed socket, never with a driver error, and must leave the
//! cluster invariants intact.

use courier_harness::{InvariantRegistry, SimCluster, SimError, client};
use courier_proto::{ErrorPayload, Frame, FrameHeader, Opcode, Payload, TargetType};
use rand::{Rng, RngCore, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;

const CLIENT_OPCODES: [Opcode; 18] = [
    Opcode::Hello,
    Opcode::Goodbye,
    Opcode::Ping,
    Opcode::Pong,
    Opcode::QueueSend,
    Opcode::MessageAck,
    Opcode::RoomCreate,
    Opcode::RoomJoin,
    Opcode::RoomLeave,
    Opcode::TypingStart,
    Opcode::TypingStop,
    Opcode::PresenceSet,
    Opcode::VoiceState,
    Opcode::Kick,
    Opcode::Mute,
    Opcode::Ban,
    Opcode::Unmute,
    Opcode::Unban,
];

fn garbage_frame(rng: &mut ChaCha8Rng) -> Frame {
    let opcode = *CLIENT_OPCODES.choose(rng).unwrap_or(&Opcode::Ping);
    let mut payload = vec![0u8; rng.gen_range(0..256)];
    rng.fill_bytes(&mut payload);
    let mut header = FrameHeader::new(opcode);
    header.set_request_id(rng.next_u32());
    Frame::new(header, payload)
}

fn feed(cluster: &mut SimCluster, socket: u64, frame: Frame) {
    match cluster.send_frame(socket, frame) {
        Ok(()) | Err(SimError::Closed { .. }) => {},
        Err(e) => panic!("garbage frame surfaced as {e}"),
    }
}

#[test]
fn garbage_after_handshake_is_answered_not_fatal() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    let mut cluster = SimCluster::new(51, 2);
    let invariants = InvariantRegistry::standard();
    let sockets: Vec<u64> =
        (0..4).map(|i| cluster.connect(i % 2, &format!("user{i}")).unwrap()).collect();

    for step in 0..400 {
        let socket = sockets[rng.gen_range(0..sockets.len())];
        let frame = garbage_frame(&mut rng);
        feed(&mut cluster, socket, frame);
        if step % 50 == 0 {
            cluster.settle().unwrap();
            invariants.assert_all(&cluster.snapshot(), &format!("after garbage step {step}"));
        }
    }
    cluster.settle().unwrap();
    invariants.assert_all(&cluster.snapshot(), "after garbage");
}

#[test]
fn garbage_before_handshake_closes_the_socket() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut cluster = SimCluster::new(52, 1);

    for _ in 0..50 {
        let socket = cluster.open(0).unwrap();
        let mut frame = garbage_frame(&mut rng);
        if frame.header.opcode() == Opcode::Hello.to_u16() {
            frame = Frame::new(FrameHeader::new(Opcode::QueueSend), vec![0xFF; 8]);
        }
        feed(&mut cluster, socket, frame);

        assert!(!cluster.is_open(socket));
        assert!(!cluster.errors(socket).is_empty());
    }
    assert_eq!(cluster.metrics(0).unwrap().connections, 0);
}

#[test]
fn server_only_opcodes_are_refused() {
    let mut cluster = SimCluster::new(53, 1);
    let socket = cluster.connect(0, "alice").unwrap();

    let forged = Payload::MessageDeliver(courier_proto::payloads::queue::Delivery {
        message_id: "forged".to_string(),
        message_type: courier_proto::MessageType::Chat,
        priority: courier_proto::Priority::Normal,
        from: "mallory".to_string(),
        room_id: None,
        payload: b"spoof".to_vec(),
        created_at_ms: 0,
        require_ack: false,
    });
    cluster.send(socket, forged).unwrap();

    let errors = cluster.errors(socket);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorPayload::PROTOCOL);
    assert!(cluster.is_open(socket));
}

#[test]
fn unknown_room_send_is_refused() {
    let mut cluster = SimCluster::new(54, 1);
    let socket = cluster.connect(0, "alice").unwrap();

    cluster.send(socket, client::chat(TargetType::Room, &["nowhere"], "hello?")).unwrap();

    let errors = cluster.errors(socket);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorPayload::ROOM_NOT_FOUND);
}
