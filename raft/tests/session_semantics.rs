//! Per-session request ordering and command deduplication (§4.4, §8
//! scenarios S2 and S3).

use raft::storage::ReadConsistency;
use raft::storage::RaftStorageDebug;
use sessionstore::Request;
use sessionstore::Response;

mod fixtures;

async fn leader_with_registered_session() -> (std::sync::Arc<fixtures::MemRaft>, std::sync::Arc<fixtures::RaftRouter>, raft::SessionId) {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;
    let registered = node.register(7, None).await.expect("register must succeed on the leader");
    (node, router, registered.session_id)
}

#[tokio::test]
async fn out_of_order_commands_are_queued_and_applied_in_sequence() {
    let (node, _router, session_id) = leader_with_registered_session().await;

    // Submit sequence 2 before sequence 1: it must not be applied until 1
    // has been.
    let node2 = node.clone();
    let second = tokio::spawn(async move { node2.command(session_id, 2, Request::Set { key: "k".into(), value: "second".into() }).await });

    // Give the out-of-order request a moment to land in the sequencer's
    // pending queue before the in-order one arrives.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let first = node.command(session_id, 1, Request::Set { key: "k".into(), value: "first".into() }).await.expect("sequence 1 must commit");
    let second = second.await.expect("task did not panic").expect("sequence 2 must commit once sequence 1 has");

    assert!(first.index < second.index, "sequence 1 must be applied before sequence 2");
    assert!(matches!(second.data, Response::Set { previous: Some(ref v) } if v == "first"), "sequence 2 must observe sequence 1's effect");
}

#[tokio::test]
async fn duplicate_command_returns_the_cached_response_without_reapplying() {
    let (node, router, session_id) = leader_with_registered_session().await;

    let first = node
        .command(session_id, 1, Request::Set { key: "k".into(), value: "v".into() })
        .await
        .expect("first submission of sequence 1 must commit");

    let applied_before = router.storage(1).await.get_state_machine().await.last_applied_log.index;

    let retried = node
        .command(session_id, 1, Request::Set { key: "k".into(), value: "v".into() })
        .await
        .expect("a retried sequence 1 must return the cached response rather than erroring");

    let applied_after = router.storage(1).await.get_state_machine().await.last_applied_log.index;

    assert_eq!(first.index, retried.index, "a retry must return the original entry's index");
    assert_eq!(first.data, retried.data);
    assert_eq!(applied_before, applied_after, "a duplicate command must not append or apply a new entry");
}

#[tokio::test]
async fn dedup_cache_keeps_every_in_flight_sequence_not_just_the_latest() {
    // §8 scenario S2→S3: a client may have several commands pipelined at
    // once, and a retry of an *earlier* one must still return that
    // sequence's own cached response rather than the most recently applied
    // one (or worse, be silently reapplied).
    let (node, router, session_id) = leader_with_registered_session().await;

    let first = node
        .command(session_id, 1, Request::Set { key: "k".into(), value: "first".into() })
        .await
        .expect("sequence 1 must commit");
    node.command(session_id, 2, Request::Set { key: "k".into(), value: "second".into() })
        .await
        .expect("sequence 2 must commit");
    node.command(session_id, 3, Request::Set { key: "k".into(), value: "third".into() })
        .await
        .expect("sequence 3 must commit");

    let applied_before = router.storage(1).await.get_state_machine().await.last_applied_log.index;

    let retried_first = node
        .command(session_id, 1, Request::Set { key: "k".into(), value: "first".into() })
        .await
        .expect("retrying sequence 1 after later sequences have applied must still hit its own cached response");

    let applied_after = router.storage(1).await.get_state_machine().await.last_applied_log.index;

    assert_eq!(first.index, retried_first.index, "sequence 1's retry must return sequence 1's original entry index");
    assert_eq!(first.data, retried_first.data);
    assert!(
        matches!(retried_first.data, Response::Set { previous: None }),
        "the cached response for sequence 1 must reflect the empty map it saw, not sequence 2 or 3's effect"
    );
    assert_eq!(applied_before, applied_after, "a cached retry must not append or apply a new entry");
}

#[tokio::test]
async fn sequential_query_reads_the_leader_s_own_applied_state() {
    let (node, _router, session_id) = leader_with_registered_session().await;
    node.command(session_id, 1, Request::Set { key: "k".into(), value: "v".into() }).await.expect("write must commit");

    let response = node
        .query(session_id, 1, ReadConsistency::Sequential, Request::Get { key: "k".into() })
        .await
        .expect("a sequential read must be served by a leader");

    assert_eq!(response.data, Response::Value(Some("v".into())));
}

#[tokio::test]
async fn linearizable_query_on_a_single_node_is_served_immediately() {
    let (node, _router, session_id) = leader_with_registered_session().await;
    node.command(session_id, 1, Request::Set { key: "k".into(), value: "v".into() }).await.expect("write must commit");

    // A single-node cluster has no other voters to confirm leadership
    // against, so Linearizable reads are served without delay.
    let response = node
        .query(session_id, 1, ReadConsistency::Linearizable, Request::Get { key: "k".into() })
        .await
        .expect("a linearizable read must be served once leadership is trivially confirmed");

    assert_eq!(response.data, Response::Value(Some("v".into())));
}

#[tokio::test]
async fn command_on_an_unknown_session_is_rejected() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let result = node.command(999, 1, Request::Set { key: "k".into(), value: "v".into() }).await;
    assert!(result.is_err(), "a command against a session the leader has never registered must be rejected");
}
