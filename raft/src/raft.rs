//! Public Raft interface and the wire types that travel between nodes and
//! between a client and the cluster leader.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::Configuration;
use crate::storage::Entry;
use crate::storage::ReadConsistency;
use crate::AppData;
use crate::AppDataResponse;
use crate::ClientId;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SessionId;
use crate::Sequence;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The handle to a running Raft node.
///
/// This type is cheap to clone and is the entry point applications use to
/// submit RPCs, client operations, and administrative commands to the node
/// running on a background task.
///
/// If any call returns `RaftError::ShuttingDown`, the node has gone into
/// shutdown, typically because of a storage error; call `shutdown` to await
/// its final exit.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Spawn a new Raft task with the given `id`, config, network, and
    /// storage, and return a handle to it.
    #[tracing::instrument(level = "trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::default());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|tx| RaftMsg::AppendEntries { rpc, tx }).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.call(|tx| RaftMsg::RequestVote { rpc, tx }).await
    }

    /// A leader's own log can never receive this RPC; it is handled by the
    /// follower/candidate roles, which always answer `{accepted: false}` (the
    /// leader already knows who it is).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> Result<PollResponse, RaftError> {
        self.call(|tx| RaftMsg::Poll { rpc, tx }).await
    }

    /// Get the ID of the current leader, as tracked by this node's metrics.
    /// Useful for routing, but `query`/`command` must still be used for
    /// guaranteed-fresh reads and writes.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit an application command to be replicated and applied (§4.1,
    /// §6). Commands are deduplicated by `(session_id, sequence)`; a retried
    /// command returns the original cached response rather than re-applying.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn command(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        data: D,
    ) -> Result<CommandResponse<R>, ClientWriteError> {
        let rpc = CommandRequest { session_id, sequence, data };
        self.call(|tx| RaftMsg::Command { rpc, tx }).await
    }

    /// Submit a read-only query under one of the three consistency modes
    /// (§4.1, §6).
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn query(
        &self,
        session_id: SessionId,
        sequence: Sequence,
        consistency: ReadConsistency,
        data: D,
    ) -> Result<CommandResponse<R>, ClientReadError> {
        let rpc = QueryRequest { session_id, sequence, consistency, data };
        self.call(|tx| RaftMsg::Query { rpc, tx }).await
    }

    /// Register a new client session (§4.1, §4.4, §6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn register(&self, client_id: ClientId, timeout_millis: Option<u64>) -> Result<RegisterResponse, ClientWriteError> {
        let rpc = RegisterRequest { client_id, timeout_millis };
        self.call(|tx| RaftMsg::Register { rpc, tx }).await
    }

    /// Tell the cluster which server a client is now addressing (§3, §4.1,
    /// §6). Replicated unconditionally, even for a client id the leader does
    /// not currently recognize (§9 Open Question 3) — the session that
    /// eventually registers under this client id picks up the binding.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn connect(&self, client_id: ClientId, address: String) -> Result<(), ClientWriteError> {
        let rpc = ConnectRequest { client_id, address };
        self.call(|tx| RaftMsg::Connect { rpc, tx }).await
    }

    /// Keep a session alive, reporting the highest command and event
    /// sequence numbers the client has observed (§4.1, §4.4, §6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn keep_alive(
        &self,
        session_id: SessionId,
        command_sequence: Sequence,
        event_sequence: Sequence,
    ) -> Result<KeepAliveResponse, ClientWriteError> {
        let rpc = KeepAliveRequest { session_id, command_sequence, event_sequence };
        self.call(|tx| RaftMsg::KeepAlive { rpc, tx }).await
    }

    /// Explicitly close a session (§4.1, §6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unregister(&self, session_id: SessionId) -> Result<(), ClientWriteError> {
        let rpc = UnregisterRequest { session_id };
        self.call(|tx| RaftMsg::Unregister { rpc, tx }).await
    }

    /// Initialize a pristine single-node cluster with the given founding
    /// members. Safe to call redundantly: `InitializeError::NotAllowed`
    /// means the cluster is already initialized.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: Configuration) -> Result<(), InitializeError> {
        self.call(|tx| RaftMsg::Initialize { members, tx }).await
    }

    /// Add a single voting or non-voting member to the cluster (§4.3, §6).
    /// Rejected with `ChangeConfigError::ConfigurationInProgress` if another
    /// reconfiguration is already underway.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn join(&self, member: crate::storage::Member) -> Result<(), ChangeConfigError> {
        self.call(|tx| RaftMsg::Join { member, tx }).await
    }

    /// Remove a single member from the cluster (§4.3, §6).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn leave(&self, member: NodeId) -> Result<(), ChangeConfigError> {
        self.call(|tx| RaftMsg::Leave { member, tx }).await
    }

    /// Propose a configuration change described by an expected predecessor
    /// configuration, guarding against a stale caller racing a concurrent
    /// change (§4.3, §9 Open Question 1).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconfigure(&self, expected: ReconfigureRequest) -> Result<(), ChangeConfigError> {
        self.call(|tx| RaftMsg::Reconfigure { rpc: expected, tx }).await
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle for blocking until the node's metrics satisfy a
    /// predicate.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait(self.inner.rx_metrics.clone(), timeout.unwrap_or_else(|| Duration::from_millis(500)))
    }

    /// Shut this node down and await the completion of its background task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }

    async fn call<F, T, E>(&self, make_msg: F) -> Result<T, E>
    where
        F: FnOnce(oneshot::Sender<Result<T, E>>) -> RaftMsg<D, R>,
        E: From<RaftError>,
    {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((make_msg(tx), span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) type RespTx<T, E> = oneshot::Sender<Result<T, E>>;

/// The internal message sent over the leader's single actor channel. Every
/// externally visible API call on `Raft` becomes exactly one of these.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries { rpc: AppendEntriesRequest<D>, tx: RespTx<AppendEntriesResponse, RaftError> },
    RequestVote { rpc: VoteRequest, tx: RespTx<VoteResponse, RaftError> },
    Poll { rpc: PollRequest, tx: RespTx<PollResponse, RaftError> },
    Command { rpc: CommandRequest<D>, tx: RespTx<CommandResponse<R>, ClientWriteError> },
    Query { rpc: QueryRequest<D>, tx: RespTx<CommandResponse<R>, ClientReadError> },
    Register { rpc: RegisterRequest, tx: RespTx<RegisterResponse, ClientWriteError> },
    Connect { rpc: ConnectRequest, tx: RespTx<(), ClientWriteError> },
    KeepAlive { rpc: KeepAliveRequest, tx: RespTx<KeepAliveResponse, ClientWriteError> },
    Unregister { rpc: UnregisterRequest, tx: RespTx<(), ClientWriteError> },
    Initialize { members: Configuration, tx: RespTx<(), InitializeError> },
    Join { member: crate::storage::Member, tx: RespTx<(), ChangeConfigError> },
    Leave { member: NodeId, tx: RespTx<(), ChangeConfigError> },
    Reconfigure { rpc: ReconfigureRequest, tx: RespTx<(), ChangeConfigError> },
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Raft-to-Raft RPCs

/// Sent by the leader to replicate log entries and, when empty, as a
/// heartbeat (§4.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev={} commit={} n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Set only when `success` is false; used for the conflicting-index
    /// replication backoff optimization (§4.2).
    pub conflict_opt: Option<ConflictOpt>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// Sent by a candidate to gather votes (§4.1).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("term={} candidate={} last_log={}", self.term, self.candidate_id, self.last_log_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Sent by a candidate, before incrementing its term, to learn whether it
/// could plausibly win an election — always answered `{accepted: false}` by
/// a node in Leader state (§6).
#[derive(Debug, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub term: u64,
    pub accepted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Client-to-cluster RPCs

/// An application command to replicate and apply (§4.1, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct CommandRequest<D: AppData> {
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub data: D,
}

impl<D: AppData> MessageSummary for CommandRequest<D> {
    fn summary(&self) -> String {
        format!("session={} seq={}", self.session_id, self.sequence)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse")]
pub struct CommandResponse<R: AppDataResponse> {
    pub index: u64,
    pub data: R,
}

/// A read-only query under one of the three consistency modes (§4.1, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct QueryRequest<D: AppData> {
    pub session_id: SessionId,
    pub sequence: Sequence,
    pub consistency: ReadConsistency,
    pub data: D,
}

impl<D: AppData> MessageSummary for QueryRequest<D> {
    fn summary(&self) -> String {
        format!("session={} seq={} consistency={:?}", self.session_id, self.sequence, self.consistency)
    }
}

/// Register a new client session (§4.1, §4.4, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_id: ClientId,
    pub timeout_millis: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub session_id: SessionId,
    pub timeout_millis: u64,
}

/// Bind a client's current network address (§3, §4.1, §6). Per §9 Open
/// Question 3, the address is replicated unconditionally, even for a client
/// id the leader does not currently recognize — the entry still commits,
/// and the apply step is what decides whether any session picks it up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client_id: ClientId,
    pub address: String,
}

/// Keep a session alive (§4.1, §4.4, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: SessionId,
    pub command_sequence: Sequence,
    pub event_sequence: Sequence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub leader_id: Option<NodeId>,
    pub members: Vec<NodeId>,
}

/// Explicitly close a session (§4.1, §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session_id: SessionId,
}

/// A configuration change proposed against an expected predecessor
/// configuration (§4.3, §9 Open Question 1). `index` and `term` name the
/// configuration the caller believes is currently active; the leader accepts
/// the change only if that still matches, or if only a member's role
/// (voter/promotable) changed without altering the active configuration's
/// identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub index: u64,
    pub term: u64,
    pub members: Configuration,
}
