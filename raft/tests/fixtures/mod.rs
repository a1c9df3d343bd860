//! An in-process stand-in for the transport layer, wiring several `Raft`
//! nodes together without any real sockets. Grounded in the teacher's
//! `RaftRouter` test fixture: a shared map from node id to running node,
//! dispatched into directly by `RaftNetwork::send_*`, with an
//! isolate/restore switch for partition tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft::config::Config;
use raft::metrics::RoleMetric;
use raft::raft::AppendEntriesRequest;
use raft::raft::AppendEntriesResponse;
use raft::raft::VoteRequest;
use raft::raft::VoteResponse;
use raft::storage::Configuration;
use raft::storage::Member;
use raft::storage::MemberRole;
use raft::NodeId;
use raft::Raft;
use raft::RaftNetwork;
use sessionstore::MemStore;
use sessionstore::Request;
use sessionstore::Response;
use tokio::sync::RwLock;

pub type MemRaft = Raft<Request, Response, RaftRouter, MemStore>;

/// A `Config` with short timeouts, suitable for tests that want elections
/// and reaping to happen quickly.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test-cluster")
            .election_timeout_min(300)
            .election_timeout_max(600)
            .heartbeat_interval(50)
            .min_session_timeout_millis(200)
            .default_session_timeout_millis(500)
            .max_session_timeout_millis(5_000)
            .validate()
            .expect("test config must satisfy its own bounds"),
    )
}

pub fn voter(id: NodeId) -> Member {
    Member { id, role: MemberRole::Voter }
}

pub fn promotable(id: NodeId) -> Member {
    Member { id, role: MemberRole::Promotable }
}

/// The in-process network. Holds every node it has been asked to create so
/// that `send_append_entries`/`send_vote` can dispatch straight into the
/// target's own `Raft` handle.
pub struct RaftRouter {
    config: Arc<Config>,
    nodes: RwLock<BTreeMap<NodeId, Arc<MemRaft>>>,
    storages: RwLock<BTreeMap<NodeId, Arc<MemStore>>>,
    isolated: RwLock<BTreeSet<NodeId>>,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            storages: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(BTreeSet::new()),
        })
    }

    pub async fn remove_node(&self, id: NodeId) -> Option<Arc<MemRaft>> {
        self.storages.write().await.remove(&id);
        self.nodes.write().await.remove(&id)
    }

    /// Stop routing RPCs to or from `id`, simulating a network partition.
    pub async fn isolate(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    pub async fn restore(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    pub async fn storage(&self, id: NodeId) -> Arc<MemStore> {
        self.storages.read().await.get(&id).cloned().expect("node must be registered with the router before its storage is inspected")
    }

    pub async fn latest_metrics(&self, id: NodeId) -> raft::RaftMetrics {
        let node = self.node(id).await.expect("node must be registered with the router");
        node.metrics().borrow().clone()
    }

    async fn node(&self, id: NodeId) -> anyhow::Result<Arc<MemRaft>> {
        self.nodes.read().await.get(&id).cloned().ok_or_else(|| anyhow::anyhow!("no such node {}", id))
    }
}

#[async_trait]
impl RaftNetwork<Request> for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<Request>) -> anyhow::Result<AppendEntriesResponse> {
        if self.isolated.read().await.contains(&target) {
            anyhow::bail!("node {} is isolated", target);
        }
        let node = self.node(target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        if self.isolated.read().await.contains(&target) {
            anyhow::bail!("node {} is isolated", target);
        }
        let node = self.node(target).await?;
        Ok(node.vote(rpc).await?)
    }
}

/// Create a fresh node backed by its own in-memory store and register it
/// with `router` so other nodes can reach it. Takes `router` by `&Arc` so
/// the new node's network handle shares the router's registry.
pub async fn new_node(router: &Arc<RaftRouter>, id: NodeId) -> Arc<MemRaft> {
    let storage = Arc::new(MemStore::new(id));
    let node = Arc::new(Raft::new(id, router.config.clone(), router.clone(), storage.clone()));
    router.nodes.write().await.insert(id, node.clone());
    router.storages.write().await.insert(id, storage);
    node
}

/// Bring up a pristine single-node cluster and wait for it to become
/// leader, per the startup path in §4.1/§4.3.
pub async fn new_single_node_leader(router: &Arc<RaftRouter>, id: NodeId) -> Arc<MemRaft> {
    let node = new_node(router, id).await;
    node.initialize(Configuration::new_initial(id)).await.expect("a pristine node must accept initialize");
    node.wait(Some(Duration::from_secs(2)))
        .metrics(|m| m.state == RoleMetric::Leader, "single node becomes leader")
        .await
        .expect("single node must become leader");
    node
}

/// Bring up `members.len()` nodes wired to the same router, initialize the
/// first as a single-node cluster with `members` as the founding
/// configuration, then wait for every member to converge on the same
/// leader and log index. This drives the remaining members up via normal
/// replication rather than via `join`, since `join` itself is one of the
/// things under test.
pub async fn new_initialized_cluster(router: &Arc<RaftRouter>, members: &[NodeId]) -> BTreeMap<NodeId, Arc<MemRaft>> {
    let mut nodes = BTreeMap::new();
    for &id in members {
        nodes.insert(id, new_node(router, id).await);
    }

    let founding = Configuration { members: members.iter().map(|id| (*id, MemberRole::Voter)).collect() };
    nodes[&members[0]].initialize(founding).await.expect("a pristine node must accept initialize");

    for node in nodes.values() {
        node.wait(Some(Duration::from_secs(5)))
            .metrics(|m| m.current_leader.is_some(), "cluster converges on a leader")
            .await
            .expect("every node must observe a leader");
    }

    nodes
}

pub async fn leader_of(nodes: &BTreeMap<NodeId, Arc<MemRaft>>) -> Option<NodeId> {
    for node in nodes.values() {
        if let Some(leader) = node.current_leader().await {
            return Some(leader);
        }
    }
    None
}
