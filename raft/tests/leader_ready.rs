//! A pristine single-node cluster reaches the `Leader` role, commits its
//! `Initialize` and founding `Configuration` entries, and reports that in
//! its metrics (§4.1, §4.3, §8 scenario S1).

use std::time::Duration;

use raft::metrics::RoleMetric;
use raft::storage::RaftStorageDebug;

mod fixtures;

#[tokio::test]
async fn single_node_becomes_leader_and_commits_its_own_entries() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.state, RoleMetric::Leader);
    assert_eq!(metrics.current_leader, Some(1));
    assert!(metrics.leader_metrics.is_some(), "a leader must report leader-only metrics");
    // Initialize (index 1) + Configuration (index 2) are both committed and
    // applied before leadership is reported ready.
    assert_eq!(metrics.last_applied, 2);

    let storage = router.storage(1).await;
    let sm = storage.get_state_machine().await;
    assert_eq!(sm.last_applied_log.index, 2);
}

#[tokio::test]
async fn redundant_initialize_is_rejected() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let result = node.initialize(raft::storage::Configuration::new_initial(1)).await;
    assert!(result.is_err(), "a second initialize on an already-initialized node must be rejected");
}

#[tokio::test]
async fn three_node_cluster_converges_on_a_single_leader() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let nodes = fixtures::new_initialized_cluster(&router, &[1, 2, 3]).await;

    let leaders: std::collections::BTreeSet<_> = {
        let mut set = std::collections::BTreeSet::new();
        for node in nodes.values() {
            node.wait(Some(Duration::from_secs(5)))
                .metrics(|m| m.current_leader.is_some(), "node observes a leader")
                .await
                .expect("every node must observe a leader");
            if let Some(leader) = node.current_leader().await {
                set.insert(leader);
            }
        }
        set
    };
    assert_eq!(leaders.len(), 1, "the cluster must converge on exactly one leader");
}
