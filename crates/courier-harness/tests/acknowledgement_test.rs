//! Acknowledgements relayed between instances.

use courier_harness::{SimCluster, client};
use courier_proto::{AckStatus, Payload, TargetType, payloads::queue::SendOptions};

fn acked() -> SendOptions {
    SendOptions { require_ack: Some(true), ..SendOptions::default() }
}

#[test]
fn room_message_settles_only_on_a_member_ack() {
    let mut cluster = SimCluster::new(31, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();
    let eve = cluster.connect(1, "eve").unwrap();
    cluster.send(alice, client::create_room("lobby")).unwrap();
    cluster.send(bob, client::join("lobby")).unwrap();
    cluster.settle().unwrap();

    cluster.send(alice, client::send(TargetType::Room, &["lobby"], "ack me", None, Some(acked()))).unwrap();
    cluster.settle().unwrap();
    let delivered = cluster.deliveries(bob);
    assert_eq!(delivered.len(), 1);
    let id = delivered[0].message_id.clone();

    cluster.send(eve, client::ack(&id, AckStatus::Read)).unwrap();
    cluster.settle().unwrap();
    let owner = cluster.driver(0).unwrap().queue();
    assert_eq!(owner.in_flight(), 1);
    assert_eq!(owner.stats().foreign_acks, 1);

    cluster.send(bob, client::ack(&id, AckStatus::Read)).unwrap();
    cluster.settle().unwrap();
    assert_eq!(cluster.driver(0).unwrap().queue().in_flight(), 0);
}

#[test]
fn failed_ack_from_another_instance_reaches_the_sender() {
    let mut cluster = SimCluster::new(32, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();

    let once = SendOptions { max_retries: Some(1), ..acked() };
    cluster.send(alice, client::send(TargetType::User, &["bob"], "fragile", None, Some(once))).unwrap();
    cluster.settle().unwrap();
    let id = cluster.deliveries(bob)[0].message_id.clone();

    cluster.send(bob, client::ack(&id, AckStatus::Failed)).unwrap();
    cluster.settle().unwrap();

    assert!(cluster.inbox(alice).iter().any(|p| matches!(
        p,
        Payload::MessageFailed(f) if f.message_id == id && f.attempts == 1
    )));
    assert_eq!(cluster.driver(0).unwrap().queue().dead_letters().len(), 1);
}
