//! Cluster reconfiguration safety: the one-at-a-time latch (§4.3, §8
//! scenario S4) and the idempotence laws for `join`/`leave` (§8 Invariant 5).

use std::time::Duration;

use raft::error::ChangeConfigError;
use raft::storage::MemberRole;
use raft::RaftStorage;

mod fixtures;

#[tokio::test]
async fn concurrent_join_is_rejected_while_a_configuration_is_uncommitted() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let nodes = fixtures::new_initialized_cluster(&router, &[1, 2, 3]).await;
    let leader_id = fixtures::leader_of(&nodes).await.expect("cluster must have a leader");
    let leader = nodes[&leader_id].clone();

    // Isolate both followers so the leader cannot reach quorum on a new
    // `Configuration` entry: it will append but stay uncommitted, holding
    // the `configuring` latch open.
    for &id in &[1u64, 2, 3] {
        if id != leader_id {
            router.isolate(id).await;
        }
    }

    let before = router.storage(leader_id).await.get_last_log_id().await.unwrap().index;

    let leader2 = leader.clone();
    let first = tokio::spawn(async move { leader2.join(fixtures::voter(4)).await });
    // Let the first join append its Configuration entry and register itself
    // as in-progress before the second one lands.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = leader.join(fixtures::voter(5)).await;
    assert!(
        matches!(second, Err(ChangeConfigError::ConfigurationInProgress)),
        "a second join must be rejected while a Configuration entry is still uncommitted, got {:?}",
        second
    );

    let after = router.storage(leader_id).await.get_last_log_id().await.unwrap().index;
    assert_eq!(before + 1, after, "the rejected join must not have appended any entry of its own");

    // Restore the cluster so the first join can commit and the spawned task
    // can be joined cleanly.
    for &id in &[1u64, 2, 3] {
        router.restore(id).await;
    }
    first.await.expect("task did not panic").expect("the first join must eventually commit once quorum is restored");
}

#[tokio::test]
async fn join_on_an_already_known_member_is_idempotent() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    node.join(fixtures::voter(1)).await.expect("joining a member that is already part of the cluster must succeed idempotently");

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.membership_config.members.len(), 1, "an idempotent join must not change the membership set");
}

#[tokio::test]
async fn leave_on_an_unknown_member_is_idempotent() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    node.leave(42).await.expect("leaving a member that was never part of the cluster must succeed idempotently");
}

#[tokio::test]
async fn leave_refuses_to_remove_the_last_voter() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let result = node.leave(1).await;
    assert!(
        matches!(result, Err(ChangeConfigError::LastVoterRemoval)),
        "removing the only voting member must be refused, got {:?}",
        result
    );
}

#[tokio::test]
async fn join_adds_a_new_member_in_promotable_role() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    node.join(fixtures::promotable(2)).await.expect("joining a brand new member must succeed");

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.membership_config.members.get(&2), Some(&MemberRole::Promotable));
}
