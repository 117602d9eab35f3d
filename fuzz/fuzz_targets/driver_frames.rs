//! Fuzz target for the server driver.
//!
//! Feeds arbitrary client operations, raw frames included, into a two
//! instance simulated cluster and checks the cluster invariants after every
//! step.

#![no_main]

use arbitrary::Arbitrary;
use courier_harness::{InvariantRegistry, SimCluster, SimError, client};
use courier_proto::{Frame, FrameHeader, Opcode, TargetType};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Connect { instance: bool, user: u8 },
    Raw { socket: u8, opcode: u16, payload: Vec<u8> },
    Direct { socket: u8, to: u8, text: String },
    Join { socket: u8, room: u8 },
    Create { socket: u8, room: u8 },
    Disconnect { socket: u8 },
    Advance { ms: u16 },
    Settle,
}

fn pick(sockets: &[u64], index: u8) -> Option<u64> {
    (!sockets.is_empty()).then(|| sockets[usize::from(index) % sockets.len()])
}

fuzz_target!(|input: (u64, Vec<Op>)| {
    let (seed, ops) = input;
    let mut cluster = SimCluster::new(seed, 2);
    let invariants = InvariantRegistry::standard();
    let mut sockets = Vec::new();

    for op in ops.into_iter().take(64) {
        let result = match op {
            Op::Connect { instance, user } => cluster
                .connect(usize::from(instance), &format!("user{}", user % 4))
                .map(|id| sockets.push(id)),
            Op::Raw { socket, opcode, payload } => match (pick(&sockets, socket), Opcode::from_u16(opcode)) {
                (Some(id), Some(opcode)) => {
                    cluster.send_frame(id, Frame::new(FrameHeader::new(opcode), payload))
                },
                _ => Ok(()),
            },
            Op::Direct { socket, to, text } => match pick(&sockets, socket) {
                Some(id) => {
                    let to = format!("user{}", to % 4);
                    cluster.send(id, client::chat(TargetType::User, &[to.as_str()], &text))
                },
                None => Ok(()),
            },
            Op::Join { socket, room } => match pick(&sockets, socket) {
                Some(id) => cluster.send(id, client::join(&format!("room{}", room % 3))),
                None => Ok(()),
            },
            Op::Create { socket, room } => match pick(&sockets, socket) {
                Some(id) => cluster.send(id, client::create_room(&format!("room{}", room % 3))),
                None => Ok(()),
            },
            Op::Disconnect { socket } => match pick(&sockets, socket) {
                Some(id) => cluster.disconnect(id),
                None => Ok(()),
            },
            Op::Advance { ms } => cluster.advance_ms(u64::from(ms) * 10),
            Op::Settle => cluster.settle(),
        };

        if let Err(e) = result {
            assert!(!matches!(e, SimError::Driver(_)), "driver error: {e}");
        }
        invariants.assert_all(&cluster.snapshot(), "fuzzed operation");
    }
});
