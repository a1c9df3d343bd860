//! Session expiry (§4.5, §8 scenario S5) and stepping down on a higher term
//! (§4.1, §8 scenario S6).

use std::time::Duration;

use raft::metrics::RoleMetric;
use raft::raft::AppendEntriesRequest;
use raft::storage::RaftStorageDebug;
use raft::LogId;

mod fixtures;

#[tokio::test]
async fn unstable_session_is_reaped_and_expire_listeners_fire_once() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    // test_config's min_session_timeout_millis is 200ms; the reaper ticks
    // every heartbeat_interval * 4 = 200ms.
    let registered = node.register(11, Some(200)).await.expect("register must succeed on the leader");

    // Nothing has kept the session alive, so after it has been stale for
    // longer than its timeout the reaper must expire it.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let storage = router.storage(1).await;
    let expired = storage.expired_sessions().await;
    assert_eq!(expired, vec![registered.session_id], "the reaper must expire exactly the one stale session, exactly once");

    // A further reap pass must not expire it a second time.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let expired_again = storage.expired_sessions().await;
    assert_eq!(expired_again, vec![registered.session_id], "an already-expired session must never be reaped twice");
}

#[tokio::test]
async fn keep_alive_prevents_an_active_session_from_being_reaped() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let registered = node.register(12, Some(400)).await.expect("register must succeed on the leader");

    // Keep the session alive for longer than one timeout window, via
    // periodic keep-alives, and confirm it is never marked expired.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        node.keep_alive(registered.session_id, 0, 0).await.expect("keep-alive must succeed while the session is open");
    }

    let storage = router.storage(1).await;
    assert!(storage.expired_sessions().await.is_empty(), "a session kept alive must never be reaped");
}

#[tokio::test]
async fn leader_steps_down_on_append_entries_with_a_higher_term() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let original_term = node.metrics().borrow().current_term;

    let rpc = AppendEntriesRequest {
        term: original_term + 5,
        leader_id: 99,
        prev_log_id: LogId::default(),
        entries: Vec::new(),
        leader_commit: 0,
    };
    let resp = node.append_entries(rpc).await.expect("the RPC channel itself must still answer even while stepping down");
    assert!(resp.success, "a follower with no conflicting log must accept an empty AppendEntries from a higher term");
    assert_eq!(resp.term, original_term + 5);

    node.wait(Some(Duration::from_secs(2)))
        .metrics(|m| m.state == RoleMetric::Follower, "node steps down to Follower")
        .await
        .expect("the node must step down to Follower");

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.current_term, original_term + 5, "the higher term must be adopted");
    assert_eq!(metrics.current_leader, Some(99), "the RPC's leader_id must be recorded as the current leader");
}

#[tokio::test]
async fn leader_rejects_append_entries_at_a_lower_term() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;
    let current_term = node.metrics().borrow().current_term;

    let rpc = AppendEntriesRequest {
        term: 0,
        leader_id: 2,
        prev_log_id: LogId::default(),
        entries: Vec::new(),
        leader_commit: 0,
    };
    let resp = node.append_entries(rpc).await.expect("the RPC channel must still answer");
    assert!(!resp.success, "a stale term must never be accepted");
    assert_eq!(resp.term, current_term);

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.state, RoleMetric::Leader, "a defensive rejection at a lower term must not affect leadership");
}

#[tokio::test]
async fn leader_never_accepts_a_vote_or_a_poll() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;
    let current_term = node.metrics().borrow().current_term;

    let poll = node
        .poll(raft::raft::PollRequest { term: current_term, candidate_id: 2, last_log_id: LogId::default() })
        .await
        .expect("poll must still answer");
    assert!(!poll.accepted, "a leader must never accept a poll");

    let vote = node
        .vote(raft::raft::VoteRequest { term: current_term, candidate_id: 2, last_log_id: LogId::default() })
        .await
        .expect("vote must still answer");
    assert!(!vote.vote_granted, "a leader must never grant a vote at an equal or lower term");

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.state, RoleMetric::Leader, "neither an equal-term vote nor a poll may cost this node its leadership");
}
