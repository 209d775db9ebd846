//! Tests for the claim/ack assignment protocol.
//!
//! Verifies that:
//! - Capacity bounds hold: two capacity-1 workers take exactly two of three
//!   targets, the third waits
//! - A worker that never acks never gains ownership
//! - Duplicate assign delivery cannot double-assign
//! - A session started off a stale or expired assign is revoked, not leaked
//! - Ownership is always single-owner


use std::sync::atomic::Ordering;
use std::time::Duration;

use netherd::coordination::{worker_topic, CoordinationBus, Message};
use netherd::registry::TargetState;

use test_harness::{assert_eventually, wait_for, FakeWorker, TestRig};

#[tokio::test]
async fn two_capacity_one_workers_take_exactly_two_of_three_targets() {
    let (rig, _source) =
        TestRig::start_with_hosts(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]).await;

    let worker_a = rig.spawn_worker(1).await;
    let worker_b = rig.spawn_worker(1).await;

    assert_eventually(
        || async { rig.ownership_counts().await == (1, 2) },
        Duration::from_secs(3),
        "Exactly two targets should be owned, one left unassigned",
    )
    .await;

    assert_eq!(rig.owned_by(worker_a.id).await, 1);
    assert_eq!(rig.owned_by(worker_b.id).await, 1);
    rig.assert_single_owner().await;

    // The pool is saturated; the third target must stay unassigned
    let still_waiting = wait_for(
        || async { rig.ownership_counts().await != (1, 2) },
        Duration::from_millis(600),
        Duration::from_millis(50),
    )
    .await;
    assert!(!still_waiting, "Saturated pool must not over-assign");

    // A third worker picks up the leftover
    let worker_c = rig.spawn_worker(1).await;
    assert_eventually(
        || async { rig.owned_by(worker_c.id).await == 1 },
        Duration::from_secs(3),
        "New capacity should absorb the waiting target",
    )
    .await;
    rig.assert_single_owner().await;

    worker_a.stop().await;
    worker_b.stop().await;
    worker_c.stop().await;
    rig.shutdown().await;
}

#[tokio::test]
async fn never_acking_worker_never_gains_ownership() {
    let (rig, _source) = TestRig::start_with_hosts(&["10.0.0.1"]).await;

    // Announces with capacity but ignores every assign
    let mut silent = FakeWorker::announce(&rig.bus, 5).await;

    let target = silent
        .next_assign(Duration::from_secs(2))
        .await
        .expect("Controller should offer the target");

    // The claim must lapse back to unassigned, never to assigned
    assert_eventually(
        || async {
            rig.registry
                .read()
                .await
                .get(&target.session_id)
                .map(|e| e.state == TargetState::Unassigned)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
        "Unacked claim should return to the pool after the claim timeout",
    )
    .await;
    assert_eq!(rig.owned_by(silent.id).await, 0);

    // A real worker joining afterwards gets the target
    let worker = rig.spawn_worker(1).await;
    assert_eventually(
        || async { rig.owned_by(worker.id).await == 1 },
        Duration::from_secs(3),
        "Target should eventually be owned by the cooperative worker",
    )
    .await;

    worker.stop().await;
    rig.shutdown().await;
}

#[tokio::test]
async fn duplicate_assign_delivery_does_not_double_assign() {
    let (rig, _source) = TestRig::start_with_hosts(&["10.0.0.1"]).await;
    let worker = rig.spawn_worker(2).await;

    assert_eventually(
        || async { rig.owned_by(worker.id).await == 1 },
        Duration::from_secs(3),
        "Worker should own the target",
    )
    .await;

    let (session_id, target) = {
        let registry = rig.registry.read().await;
        let entry = &registry.all_entries()[0];
        (entry.target.session_id, entry.target.clone())
    };

    // Replay the assign as a duplicated broker delivery
    rig.bus
        .publish(
            &worker_topic(worker.id),
            Message::Assign { session_id, target },
        )
        .await
        .unwrap();

    // The worker re-acks; ownership must not change shape
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.owned_by(worker.id).await, 1);
    assert_eq!(worker.factory.opens.load(Ordering::SeqCst), 1);
    rig.assert_single_owner().await;

    worker.stop().await;
    rig.shutdown().await;
}

/// A stale broker delivery replays an owned target's assign to a different
/// worker. That worker opens a session and acks, but the ack does not match
/// the registry, so its next check-in exposes the foreign session and the
/// controller revokes it. Ownership never moves and the extra session is
/// closed instead of lingering alongside the owner's.
#[tokio::test]
async fn replayed_assign_to_the_wrong_worker_is_revoked() {
    let (rig, _source) = TestRig::start_with_hosts(&["10.0.0.1"]).await;

    let owner = rig.spawn_worker(1).await;
    assert_eventually(
        || async { rig.owned_by(owner.id).await == 1 },
        Duration::from_secs(3),
        "Owner should hold the target",
    )
    .await;

    let bystander = rig.spawn_worker(1).await;
    // Wait until the bystander is registered (it subscribes before it
    // announces), so the replayed assign below is actually delivered.
    assert_eventually(
        || async { rig.directory.read().await.get(&bystander.id).is_some() },
        Duration::from_secs(2),
        "Bystander should register with the controller",
    )
    .await;
    let (session_id, target) = {
        let registry = rig.registry.read().await;
        let entry = &registry.all_entries()[0];
        (entry.target.session_id, entry.target.clone())
    };

    rig.bus
        .publish(
            &worker_topic(bystander.id),
            Message::Assign { session_id, target },
        )
        .await
        .unwrap();

    // The phantom session it opened must be revoked and closed
    assert_eventually(
        || async {
            bystander.factory.opens.load(Ordering::SeqCst) == 1
                && bystander.factory.closes.load(Ordering::SeqCst) == 1
        },
        Duration::from_secs(3),
        "Foreign session should be revoked on the next check-in",
    )
    .await;

    assert_eq!(rig.owned_by(owner.id).await, 1);
    assert_eq!(rig.owned_by(bystander.id).await, 0);
    assert_eq!(owner.factory.closes.load(Ordering::SeqCst), 0);
    rig.assert_single_owner().await;

    owner.stop().await;
    bystander.stop().await;
    rig.shutdown().await;
}

/// An expired claim sends a revoke to the worker it was offered to: its ack
/// (and thus its session) may simply have been lost on the bus.
#[tokio::test]
async fn expired_claim_sends_a_revoke_to_the_offered_worker() {
    let (rig, _source) = TestRig::start_with_hosts(&["10.0.0.1"]).await;
    let mut worker = FakeWorker::announce(&rig.bus, 1).await;

    let target = worker.next_assign(Duration::from_secs(2)).await.unwrap();

    // No ack. Stay alive across the claim window so expiry, not worker
    // death, is what resolves the claim.
    tokio::time::sleep(Duration::from_millis(150)).await;
    worker.checkin(&[]).await;

    let revoked = worker.next_revoke(Duration::from_secs(2)).await;
    assert_eq!(revoked, Some(target.session_id));
    assert_eq!(rig.owned_by(worker.id).await, 0);

    rig.shutdown().await;
}

#[tokio::test]
async fn stray_ack_without_claim_gains_nothing() {
    let (rig, _source) = TestRig::start_with_hosts(&["10.0.0.1"]).await;
    let rogue = FakeWorker::announce(&rig.bus, 0).await;

    assert_eventually(
        || async { rig.registry.read().await.len() == 1 },
        Duration::from_secs(2),
        "Target should be registered",
    )
    .await;
    let session_id = {
        let registry = rig.registry.read().await;
        registry.all_entries()[0].target.session_id
    };

    // Ack for a session never offered to this worker
    rogue.ack(session_id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(rig.owned_by(rogue.id).await, 0);
    rig.assert_single_owner().await;

    rig.shutdown().await;
}
