//! Delivery across instances sharing one broker.
//!
//! Every scenario connects clients to different instances and checks that
//! each recipient sees a message exactly once, whichever instance accepted
//! it.

use courier_harness::{InvariantRegistry, SimCluster, client};
use courier_proto::{ErrorPayload, Payload, TargetType};

#[test]
fn direct_message_reaches_user_on_another_instance() {
    let mut cluster = SimCluster::new(7, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();

    cluster.send(alice, client::chat(TargetType::User, &["bob"], "hi bob")).unwrap();
    assert!(cluster.inbox(alice).iter().any(|p| matches!(p, Payload::QueueEnqueued(_))));

    cluster.settle().unwrap();

    assert_eq!(cluster.delivered_texts(bob), vec!["hi bob"]);
    assert!(cluster.delivered_texts(alice).is_empty());
    InvariantRegistry::standard().assert_all(&cluster.snapshot(), "after direct delivery");
}

#[test]
fn every_socket_of_the_recipient_gets_a_copy() {
    let mut cluster = SimCluster::new(8, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let phone = cluster.connect(0, "bob").unwrap();
    let laptop = cluster.connect(1, "bob").unwrap();

    cluster.send(alice, client::chat(TargetType::User, &["bob"], "both devices")).unwrap();
    cluster.settle().unwrap();

    assert_eq!(cluster.delivered_texts(phone), vec!["both devices"]);
    assert_eq!(cluster.delivered_texts(laptop), vec!["both devices"]);
}

#[test]
fn room_message_reaches_members_on_every_instance() {
    let mut cluster = SimCluster::new(9, 3);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();
    let carol = cluster.connect(2, "carol").unwrap();

    cluster.send(alice, client::create_room("lobby")).unwrap();
    cluster.send(bob, client::join("lobby")).unwrap();
    cluster.send(carol, client::join("lobby")).unwrap();
    cluster.settle().unwrap();
    assert!(cluster.inbox(bob).iter().any(|p| matches!(p, Payload::RoomJoined(_))));

    cluster.send(alice, client::chat(TargetType::Room, &["lobby"], "welcome")).unwrap();
    cluster.settle().unwrap();

    for socket in [alice, bob, carol] {
        let deliveries = cluster.deliveries(socket);
        assert_eq!(deliveries.len(), 1, "socket {socket} got {deliveries:?}");
        assert_eq!(deliveries[0].room_id.as_deref(), Some("lobby"));
        assert_eq!(deliveries[0].from, "alice");
    }
}

#[test]
fn room_membership_is_announced_across_instances() {
    let mut cluster = SimCluster::new(10, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();

    cluster.send(alice, client::create_room("lobby")).unwrap();
    cluster.send(bob, client::join("lobby")).unwrap();
    cluster.settle().unwrap();

    let announced = cluster.inbox(alice).iter().any(|p| {
        matches!(p, Payload::MemberUpdate(u) if u.user_id == "bob" && u.room_id == "lobby" && u.joined)
    });
    assert!(announced, "alice never saw bob join: {:?}", cluster.inbox(alice));
}

#[test]
fn global_broadcast_reaches_every_connected_user() {
    let mut cluster = SimCluster::new(11, 3);
    let sockets: Vec<u64> = ["alice", "bob", "carol"]
        .iter()
        .enumerate()
        .map(|(i, user)| cluster.connect(i, user).unwrap())
        .collect();

    cluster.send(sockets[0], client::chat(TargetType::Global, &["*"], "maintenance at noon")).unwrap();
    cluster.settle().unwrap();

    for socket in sockets {
        assert_eq!(cluster.delivered_texts(socket), vec!["maintenance at noon"]);
    }
}

#[test]
fn offline_user_gets_mailbox_on_another_instance() {
    let mut cluster = SimCluster::new(12, 2);
    let alice = cluster.connect(0, "alice").unwrap();

    cluster.send(alice, client::chat(TargetType::User, &["bob"], "while you were out")).unwrap();
    cluster.settle().unwrap();

    let bob = cluster.connect(1, "bob").unwrap();
    assert_eq!(cluster.delivered_texts(bob), vec!["while you were out"]);

    // The mailbox drains on first connect
    cluster.disconnect(bob).unwrap();
    let again = cluster.connect(1, "bob").unwrap();
    assert!(cluster.delivered_texts(again).is_empty());
}

#[test]
fn no_duplicate_delivery_with_many_instances() {
    let mut cluster = SimCluster::new(13, 3);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(2, "bob").unwrap();

    for i in 0..5 {
        cluster.send(alice, client::chat(TargetType::User, &["bob"], &format!("m{i}"))).unwrap();
    }
    cluster.settle().unwrap();
    cluster.settle().unwrap();

    let mut texts = cluster.delivered_texts(bob);
    texts.sort();
    assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);

    let fabric = cluster.driver(1).unwrap().fabric().stats();
    assert!(fabric.received >= 5);
}

#[test]
fn burst_over_limit_is_penalized_then_lifted() {
    let mut cluster = SimCluster::new(14, 1);
    let alice = cluster.connect(0, "alice").unwrap();
    let burst = cluster.driver(0).unwrap().config().queue.burst_limit;
    let penalty_ms = cluster.driver(0).unwrap().config().queue.penalty_ms;

    for i in 0..=burst {
        cluster.send(alice, client::chat(TargetType::User, &["bob"], &format!("m{i}"))).unwrap();
    }
    let errors = cluster.errors(alice);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorPayload::RATE_LIMITED);
    assert_eq!(errors[0].retry_after_ms, Some(penalty_ms));

    // Still serving the penalty
    cluster.advance_ms(penalty_ms - 1).unwrap();
    cluster.send(alice, client::chat(TargetType::User, &["bob"], "too soon")).unwrap();
    assert_eq!(cluster.errors(alice).len(), 2);

    cluster.advance_ms(1).unwrap();
    cluster.take_inbox(alice);
    cluster.send(alice, client::chat(TargetType::User, &["bob"], "later")).unwrap();
    assert!(cluster.errors(alice).is_empty());
    assert!(cluster.inbox(alice).iter().any(|p| matches!(p, Payload::QueueEnqueued(_))));
}
