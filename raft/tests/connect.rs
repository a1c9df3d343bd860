//! Client address binding (§3, §4.1, §6, §9 Open Question 3).

use raft::storage::RaftStorageDebug;
use sessionstore::Request;
use sessionstore::Response;

mod fixtures;

#[tokio::test]
async fn connect_for_an_unrecognized_client_still_replicates_and_commits() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let before = router.storage(1).await.get_state_machine().await.last_applied_log.index;

    node.connect(4242, "127.0.0.1:5000".into())
        .await
        .expect("connect must commit even for a client the leader has never seen registered");

    let after = router.storage(1).await.get_state_machine().await.last_applied_log.index;
    assert!(after > before, "the Connect entry must still be replicated and applied");
}

#[tokio::test]
async fn connect_for_a_known_client_binds_its_session_address() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let client_id = 7;
    let registered = node.register(client_id, None).await.expect("register must succeed on the leader");

    node.connect(client_id, "10.0.0.9:4000".into()).await.expect("connect for a known client must commit");

    let session = router.storage(1).await.sessions().get(registered.session_id).await.expect("session must still be present");
    assert_eq!(session.address, Some("10.0.0.9:4000".into()));
}

#[tokio::test]
async fn connect_does_not_disturb_an_unrelated_session() {
    let router = fixtures::RaftRouter::new(fixtures::test_config());
    let node = fixtures::new_single_node_leader(&router, 1).await;

    let client_id = 11;
    let registered = node.register(client_id, None).await.expect("register must succeed on the leader");
    node.command(registered.session_id, 1, Request::Set { key: "k".into(), value: "v".into() })
        .await
        .expect("command must commit");

    node.connect(999, "10.0.0.1:1".into()).await.expect("connect for an unrelated client must still commit");

    let session = router.storage(1).await.sessions().get(registered.session_id).await.expect("session must still be present");
    assert_eq!(session.address, None, "an unrelated client's connect must not touch this session");

    let response = node
        .query(registered.session_id, 1, raft::storage::ReadConsistency::Sequential, Request::Get { key: "k".into() })
        .await
        .expect("read must still be served");
    assert_eq!(response.data, Response::Value(Some("v".into())));
}
