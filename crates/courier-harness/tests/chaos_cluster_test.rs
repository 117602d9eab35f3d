//! Randomized workloads over a broker that fails on purpose.
//!
//! Operations may fail individually (refused handshakes, broker errors,
//! closed sockets); the cluster invariants must hold after every one of
//! them regardless.

use courier_harness::{InvariantRegistry, SimCluster, SimEnv, client};
use courier_proto::TargetType;
use courier_server::{Broker, ChaoticBroker, CourierConfig, MemoryBroker};
use proptest::prelude::*;

const INSTANCES: usize = 3;
const USERS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const ROOMS: [&str; 2] = ["lobby", "dev"];

#[derive(Debug, Clone)]
enum Op {
    Connect { instance: usize, user: usize },
    Resume { socket: usize, instance: usize },
    Disconnect { socket: usize },
    Goodbye { socket: usize },
    Direct { socket: usize, to: usize },
    CreateRoom { socket: usize, room: usize },
    Join { socket: usize, room: usize },
    RoomChat { socket: usize, room: usize },
    Ban { socket: usize, room: usize, user: usize },
    Advance { ms: u64 },
    Settle,
    Crash { instance: usize },
    Restart { instance: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let instance = 0..INSTANCES;
    let user = 0..USERS.len();
    let room = 0..ROOMS.len();
    let socket = 0usize..32;

    prop_oneof![
        4 => (instance.clone(), user.clone()).prop_map(|(instance, user)| Op::Connect { instance, user }),
        1 => (socket.clone(), instance.clone()).prop_map(|(socket, instance)| Op::Resume { socket, instance }),
        1 => socket.clone().prop_map(|socket| Op::Disconnect { socket }),
        1 => socket.clone().prop_map(|socket| Op::Goodbye { socket }),
        4 => (socket.clone(), user.clone()).prop_map(|(socket, to)| Op::Direct { socket, to }),
        1 => (socket.clone(), room.clone()).prop_map(|(socket, room)| Op::CreateRoom { socket, room }),
        2 => (socket.clone(), room.clone()).prop_map(|(socket, room)| Op::Join { socket, room }),
        3 => (socket.clone(), room.clone()).prop_map(|(socket, room)| Op::RoomChat { socket, room }),
        1 => (socket.clone(), room, user).prop_map(|(socket, room, user)| Op::Ban { socket, room, user }),
        2 => (0u64..40_000).prop_map(|ms| Op::Advance { ms }),
        2 => Just(Op::Settle),
        1 => instance.clone().prop_map(|instance| Op::Crash { instance }),
        1 => instance.prop_map(|instance| Op::Restart { instance }),
    ]
}

struct Workload<B: Broker> {
    cluster: SimCluster<B>,
    sockets: Vec<u64>,
}

impl<B: Broker> Workload<B> {
    fn pick(&self, index: usize) -> Option<u64> {
        (!self.sockets.is_empty()).then(|| self.sockets[index % self.sockets.len()])
    }

    /// Session of a closed socket that no open socket currently holds.
    fn resumable(&self, socket: u64) -> Option<(String, String)> {
        let closed = self.cluster.socket(socket).ok().filter(|s| !s.is_open())?;
        let session = closed.session_id.clone()?;
        let held = self.sockets.iter().any(|id| {
            self.cluster.is_open(*id) && self.cluster.session_id(*id) == Some(session.as_str())
        });
        if held {
            return None;
        }
        Some((closed.user_id.clone()?, session))
    }

    fn apply(&mut self, op: Op) {
        let result = match op {
            Op::Connect { instance, user } => {
                self.cluster.connect(instance, USERS[user]).map(|id| self.sockets.push(id))
            },
            Op::Resume { socket, instance } => {
                let Some((user, session)) = self.pick(socket).and_then(|s| self.resumable(s)) else {
                    return;
                };
                self.cluster.resume(instance, &user, &session).map(|id| self.sockets.push(id))
            },
            Op::Disconnect { socket } => self.on(socket, |c, s| c.disconnect(s)),
            Op::Goodbye { socket } => self.on(socket, |c, s| c.send(s, client::goodbye())),
            Op::Direct { socket, to } => self.on(socket, |c, s| {
                c.send(s, client::chat(TargetType::User, &[USERS[to]], "direct"))
            }),
            Op::CreateRoom { socket, room } => {
                self.on(socket, |c, s| c.send(s, client::create_room(ROOMS[room])))
            },
            Op::Join { socket, room } => self.on(socket, |c, s| c.send(s, client::join(ROOMS[room]))),
            Op::RoomChat { socket, room } => self.on(socket, |c, s| {
                c.send(s, client::chat(TargetType::Room, &[ROOMS[room]], "room"))
            }),
            Op::Ban { socket, room, user } => {
                self.on(socket, |c, s| c.send(s, client::ban(ROOMS[room], USERS[user])))
            },
            Op::Advance { ms } => self.cluster.advance_ms(ms),
            Op::Settle => self.cluster.settle(),
            Op::Crash { instance } => {
                self.cluster.crash(instance);
                Ok(())
            },
            Op::Restart { instance } => self.cluster.restart(instance).map(|_| ()),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "operation failed");
        }
    }

    fn on(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut SimCluster<B>, u64) -> Result<(), courier_harness::SimError>,
    ) -> Result<(), courier_harness::SimError> {
        match self.pick(index) {
            Some(socket) => f(&mut self.cluster, socket),
            None => Ok(()),
        }
    }
}

fn chaotic_cluster(seed: u64, failure_rate: f64) -> SimCluster<ChaoticBroker<MemoryBroker>> {
    let broker = ChaoticBroker::with_seed(MemoryBroker::new(), failure_rate, seed);
    SimCluster::with_broker(SimEnv::with_seed(seed), broker, INSTANCES, CourierConfig::default())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invariants hold after every operation while the broker fails a
    /// fraction of its calls.
    #[test]
    fn prop_invariants_hold_under_broker_chaos(
        seed in any::<u64>(),
        failure_rate in 0.0f64..0.3,
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        let invariants = InvariantRegistry::standard();
        let mut workload = Workload { cluster: chaotic_cluster(seed, failure_rate), sockets: Vec::new() };

        for (step, op) in ops.into_iter().enumerate() {
            let description = format!("{op:?}");
            workload.apply(op);
            let checked = invariants.check_all(&workload.cluster.snapshot());
            prop_assert!(checked.is_ok(), "step {} ({}): {:?}", step, description, checked);
        }
    }

    /// With a healthy broker every direct message to a connected user is
    /// delivered exactly once, whichever instances the two sit on.
    #[test]
    fn prop_direct_messages_delivered_once(
        seed in any::<u64>(),
        sender in 0..INSTANCES,
        recipient in 0..INSTANCES,
        count in 1usize..8,
    ) {
        let mut cluster = SimCluster::new(seed, INSTANCES);
        let alice = cluster.connect(sender, "alice").unwrap();
        let bob = cluster.connect(recipient, "bob").unwrap();

        for i in 0..count {
            cluster.send(alice, client::chat(TargetType::User, &["bob"], &format!("m{i}"))).unwrap();
        }
        cluster.settle().unwrap();

        let mut texts = cluster.delivered_texts(bob);
        texts.sort();
        let expected: Vec<String> = (0..count).map(|i| format!("m{i}")).collect();
        prop_assert_eq!(texts, expected);
    }
}
