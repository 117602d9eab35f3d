//! Durable state across full process restarts.
//!
//! Each test runs a cluster over a `RedbBroker`, drops everything (as a
//! process exit would), reopens the database file and checks what a fresh
//! cluster finds there.

use std::path::Path;

use courier_harness::{SimCluster, SimEnv, client};
use courier_proto::{Payload, TargetType};
use courier_server::{CourierConfig, RedbBroker};
use tempfile::tempdir;

fn cluster_at(path: &Path, seed: u64) -> SimCluster<RedbBroker> {
    let broker = RedbBroker::open(path).unwrap();
    SimCluster::with_broker(SimEnv::with_seed(seed), broker, 2, CourierConfig::default())
}

fn reconnected(cluster: &SimCluster<RedbBroker>, socket: u64) -> bool {
    cluster.inbox(socket).iter().any(|p| matches!(p, Payload::ConnectionEstablished(e) if e.reconnection))
}

#[test]
fn guaranteed_message_delivered_after_process_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.redb");

    {
        let mut cluster = cluster_at(&path, 1);
        let alice = cluster.connect(0, "alice").unwrap();
        let send = client::send(TargetType::User, &["bob"], "survives", None, Some(client::guaranteed()));
        cluster.send(alice, send).unwrap();
    }

    let mut cluster = cluster_at(&path, 2);
    let bob = cluster.connect(1, "bob").unwrap();
    assert_eq!(cluster.restart(0).unwrap(), 1);
    cluster.settle().unwrap();

    assert_eq!(cluster.delivered_texts(bob), vec!["survives"]);
}

#[test]
fn sessions_resume_after_process_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.redb");

    let session = {
        let mut cluster = cluster_at(&path, 3);
        let alice = cluster.connect(0, "alice").unwrap();
        cluster.send(alice, client::create_room("lobby")).unwrap();
        let session = cluster.session_id(alice).unwrap().to_string();
        cluster.shutdown(0).unwrap();
        session
    };

    let mut cluster = cluster_at(&path, 4);
    let alice = cluster.resume(1, "alice", &session).unwrap();

    assert!(reconnected(&cluster, alice));
    let rooms: Vec<_> = cluster
        .inbox(alice)
        .iter()
        .filter_map(|p| match p {
            Payload::RoomJoined(joined) => Some(joined.room.room_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(rooms, vec!["lobby"]);
}

#[test]
fn offline_mailbox_survives_process_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.redb");

    {
        let mut cluster = cluster_at(&path, 5);
        let alice = cluster.connect(0, "alice").unwrap();
        cluster.send(alice, client::chat(TargetType::User, &["carol"], "see you")).unwrap();
        cluster.settle().unwrap();
    }

    let mut cluster = cluster_at(&path, 6);
    let carol = cluster.connect(1, "carol").unwrap();
    assert_eq!(cluster.delivered_texts(carol), vec!["see you"]);
}
