//! Instance crashes between admission and delivery.
//!
//! A guaranteed message is persisted before the sender sees
//! `queue:enqueued`; a restarted instance re-admits what it had not finished
//! and delivers it exactly once.

use courier_core::Environment;
use courier_harness::{InvariantRegistry, SimCluster, SimEnv, client};
use courier_proto::{Payload, Priority, TargetType};
use courier_server::{Broker, CourierConfig, RedbBroker};

fn pending_records<B: Broker>(cluster: &SimCluster<B>) -> Vec<String> {
    let now_ms = cluster.env().wall_clock_ms();
    cluster.broker().keys("message:", now_ms).unwrap()
}

fn crash_before_delivery<B: Broker>(mut cluster: SimCluster<B>) {
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();

    let guaranteed = client::send(
        TargetType::User,
        &["bob"],
        "must arrive",
        Some(Priority::High),
        Some(client::guaranteed()),
    );
    cluster.send(alice, guaranteed).unwrap();
    assert!(cluster.inbox(alice).iter().any(|p| matches!(p, Payload::QueueEnqueued(_))));
    assert_eq!(pending_records(&cluster).len(), 1);

    cluster.crash(0);
    assert!(cluster.delivered_texts(bob).is_empty());

    assert_eq!(cluster.restart(0).unwrap(), 1);
    cluster.settle().unwrap();

    assert_eq!(cluster.delivered_texts(bob), vec!["must arrive"]);
    assert!(pending_records(&cluster).is_empty());

    // A second restart finds nothing left to do
    assert_eq!(cluster.restart(0).unwrap(), 0);
    cluster.settle().unwrap();
    assert_eq!(cluster.delivered_texts(bob).len(), 1);
    InvariantRegistry::standard().assert_all(&cluster.snapshot(), "after recovery");
}

#[test]
fn guaranteed_message_survives_crash() {
    crash_before_delivery(SimCluster::new(41, 2));
}

#[test]
fn guaranteed_message_survives_crash_on_redb() {
    let dir = tempfile::tempdir().unwrap();
    let broker = RedbBroker::open(dir.path().join("courier.redb")).unwrap();
    let cluster =
        SimCluster::with_broker(SimEnv::with_seed(42), broker, 2, CourierConfig::default());
    crash_before_delivery(cluster);
}

#[test]
fn best_effort_message_is_lost_with_its_instance() {
    let mut cluster = SimCluster::new(43, 2);
    let alice = cluster.connect(0, "alice").unwrap();
    let bob = cluster.connect(1, "bob").unwrap();

    cluster.send(alice, client::chat(TargetType::User, &["bob"], "fire and forget")).unwrap();
    assert!(pending_records(&cluster).is_empty());

    cluster.crash(0);
    assert_eq!(cluster.restart(0).unwrap(), 0);
    cluster.settle().unwrap();

    assert!(cluster.delivered_texts(bob).is_empty());
}

#[test]
fn recovery_leaves_other_instances_records_alone() {
    let mut cluster = SimCluster::new(44, 2);
    let alice = cluster.connect(1, "alice").unwrap();
    cluster.connect(0, "bob").unwrap();

    let guaranteed =
        client::send(TargetType::User, &["bob"], "owned by 2", None, Some(client::guaranteed()));
    cluster.send(alice, guaranteed).unwrap();

    assert_eq!(cluster.restart(0).unwrap(), 0);
    assert_eq!(pending_records(&cluster).len(), 1);
}
