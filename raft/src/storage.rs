//! The Raft storage interface and the data types it reads and writes.
//!
//! Log compaction and snapshot transfer are out of scope (see `SPEC_FULL.md`
//! §1), so unlike the teacher's `RaftStorage` this trait has no associated
//! `SnapshotData` type and no snapshot methods. Everything else keeps the
//! teacher's shape: entries are appended and applied in batches, state is
//! read back through a handful of narrow accessors, and the session table is
//! exposed for concurrent read access from the transport layer.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::error::Error;
use std::ops::Range;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::AppData;
use crate::AppDataResponse;
use crate::ClientId;
use crate::LogId;
use crate::LogIndex;
use crate::MemberId;
use crate::NodeId;
use crate::SessionId;
use crate::Term;
use crate::Timestamp;

/// A single, uniquely placed record in the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn new_initialize(log_id: LogId) -> Self {
        Self { log_id, payload: EntryPayload::Initialize }
    }
}

/// The business meaning of a log entry. `Query` has no variant here: reads
/// are never written to the log, they ride the commit index that is already
/// there.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub enum EntryPayload<D: AppData> {
    /// A no-op appended immediately on taking leadership (§4.1). Named
    /// `Initialize` to match the data model in §3; distinct from
    /// `Raft::initialize`, which only seeds this node's in-memory
    /// membership before an election ever happens.
    Initialize,
    /// The cluster membership list: both the founding configuration and
    /// every subsequent single-step change, written by the
    /// ConfigCoordinator.
    Configuration(Configuration),
    /// An application command, opaque to this crate.
    Command { client_id: ClientId, session_id: SessionId, sequence: crate::Sequence, data: D },
    /// A client session registration.
    Register { client_id: ClientId, timeout_millis: u64 },
    /// A reconnection of an existing client to this server, carrying the
    /// client's current address for session-affinity bookkeeping. Keyed by
    /// `ClientId`, not `SessionId` (§3, §9 Open Question 3): the address
    /// replicates unconditionally, even for a client this leader has never
    /// seen register a session.
    Connect { client_id: ClientId, address: String },
    /// A session keep-alive, carrying the highest command sequence and
    /// query sequence the client has observed a response for.
    KeepAlive { session_id: SessionId, command_sequence: crate::Sequence, event_sequence: crate::Sequence },
    /// Closes a session, either by explicit client request or because the
    /// SessionReaper determined it had gone stale.
    Unregister { session_id: SessionId, expired: bool },
}

/// Whether a cluster member can vote, is catching up so that it may later be
/// promoted, or has been demoted and is only kept for log delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberRole {
    Voter,
    Promotable,
}

/// A single member of a cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub role: MemberRole,
}

/// The set of members participating in the cluster. Single-step
/// reconfiguration means there is only ever one of these in force at a time;
/// there is no joint/old-new split to track.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub members: BTreeMap<MemberId, MemberRole>,
}

impl Configuration {
    pub fn new_initial(id: MemberId) -> Self {
        let mut members = BTreeMap::new();
        members.insert(id, MemberRole::Voter);
        Self { members }
    }

    pub fn voters(&self) -> BTreeSet<MemberId> {
        self.members
            .iter()
            .filter(|(_, role)| **role == MemberRole::Voter)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    /// True if `next` only adds or removes a single member, or only changes
    /// the role of an existing one, relative to `self`. Resolves Open
    /// Question 1: what counts as a legal single-step reconfiguration.
    pub fn is_single_step_from(&self, next: &Configuration) -> bool {
        let added: Vec<_> = next.members.keys().filter(|id| !self.members.contains_key(id)).collect();
        let removed: Vec<_> = self.members.keys().filter(|id| !next.members.contains_key(id)).collect();
        let changed_role = self
            .members
            .iter()
            .filter(|(id, role)| next.members.get(id).map(|r| r != *role).unwrap_or(false))
            .count();

        match (added.len(), removed.len(), changed_role) {
            (1, 0, 0) | (0, 1, 0) => true,
            (0, 0, n) if n <= 1 => true,
            _ => false,
        }
    }

    /// True if `next` has exactly the same member ids as `self` — any
    /// difference between the two is confined to a member's role, never an
    /// addition or removal. Used to decide whether a reconfigure request's
    /// stale `term` can still be forgiven (§9 Open Question 1).
    pub fn is_role_only_change(&self, next: &Configuration) -> bool {
        self.members.keys().eq(next.members.keys())
    }
}

/// A record holding the hard state of a Raft node: the last term it has
/// seen, and who it voted for in that term.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// The state a Raft node needs when first starting, assembled from whatever
/// the storage layer already has on disk.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied_log: LogId,
    pub hard_state: HardState,
    pub membership: Configuration,
}

impl InitialState {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied_log: LogId::default(),
            hard_state: HardState::default(),
            membership: Configuration::new_initial(id),
        }
    }
}

/// Read-consistency mode requested by a `query`. See §4.1/§6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// May be served from the last applied index without contacting peers.
    Sequential,
    /// May be served once the leader's heartbeat lease is still valid;
    /// falls back to `Linearizable` if the lease has expired.
    LinearizableLease,
    /// Requires a fresh round of heartbeats acknowledged by a quorum before
    /// the query is evaluated.
    Linearizable,
}

/// Lifecycle state of a client session, as tracked by the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Stable,
    /// Missed at least one expected keep-alive window; one more miss closes
    /// the session. See §4.5.
    Unstable,
    Expired,
}

/// A single client session as recorded by the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub client_id: ClientId,
    pub state: SessionState,
    pub timeout_millis: u64,
    pub last_updated: Timestamp,
    pub last_command_sequence: crate::Sequence,
    pub last_event_sequence: crate::Sequence,
    pub address: Option<String>,
    /// Set once the leader has appended an `Unregister{expired: true}` for
    /// this session, to prevent the reaper from issuing a second one while
    /// the first is still committing (§4.5).
    pub unregistering: bool,
}

/// The session table, held behind `RwLock`s so the transport layer can read
/// session addresses and connection state without routing through the
/// leader's single-threaded actor. Mutation only ever happens on apply,
/// which runs on the leader's own task, so writers never contend with each
/// other — only with concurrent readers.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<BTreeMap<SessionId, Session>>,
    by_client: RwLock<BTreeMap<ClientId, SessionId>>,
    /// The non-replicated "connections" index (§4.1, §5): the address a
    /// client most recently connected from, recorded immediately on receipt
    /// rather than waiting on the replicated `Connect` entry to commit, and
    /// kept even for a client with no session at all.
    connections: RwLock<BTreeMap<ClientId, String>>,
}

impl SessionTable {
    pub async fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn lookup_by_client(&self, client_id: ClientId) -> Option<SessionId> {
        self.by_client.read().await.get(&client_id).copied()
    }

    /// Record `address` as `client_id`'s current connection, in memory only
    /// (§4.1 step 1: "register the connection" precedes replicating the
    /// `Connect` entry, and happens regardless of whether a session exists).
    pub async fn bind_connection(&self, client_id: ClientId, address: String) {
        self.connections.write().await.insert(client_id, address);
    }

    pub async fn connection_address(&self, client_id: ClientId) -> Option<String> {
        self.connections.read().await.get(&client_id).cloned()
    }

    pub async fn insert(&self, session: Session) {
        let id = session.id;
        let client_id = session.client_id;
        self.sessions.write().await.insert(id, session);
        self.by_client.write().await.insert(client_id, id);
    }

    pub async fn update<F: FnOnce(&mut Session)>(&self, id: SessionId, f: F) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(s) => {
                f(s);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(s) = &removed {
            self.by_client.write().await.remove(&s.client_id);
        }
        removed
    }

    pub async fn all(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn open_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn unstable_count(&self) -> usize {
        self.sessions.read().await.values().filter(|s| s.state == SessionState::Unstable).count()
    }
}

/// An application-defined error kind returned from a failed `Command` apply
/// (§4.1 item 6, §7): carries enough to surface the failure to the one
/// client that issued it, verbatim, without the whole batch `apply` erroring
/// out and taking the node down the way a storage failure does. Cached in
/// the sequencer's response map the same as a success, so a retried command
/// sees the identical error rather than a second attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    pub kind: String,
    pub message: String,
}

/// The outcome of applying one entry to the state machine.
#[derive(Clone, Debug)]
pub enum ApplyOutcome<R: AppDataResponse> {
    /// A `Command` entry was applied; `Err` carries an application-defined
    /// failure rather than the whole-batch `anyhow::Result` used for
    /// storage faults.
    Command(Result<R, AppError>),
    /// A `Register` entry assigned a session id.
    Registered(SessionId),
    /// Any other entry kind that does not hand a value back to the caller
    /// (`Connect`, `KeepAlive`, `Unregister`, `Configuration`, `Blank`,
    /// `Initialize`).
    Ack,
}

/// A trait defining the interface for a Raft storage and state machine
/// implementation.
///
/// As in the teacher, errors returned from any method other than
/// `apply_to_state_machine` are treated as unrecoverable and drive the node
/// into shutdown; `apply_to_state_machine` may return an application-level
/// `ShutdownError` as well, but ordinary command failures are expected to be
/// encoded in `R` rather than in `Result::Err`.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership configuration found in the log, or the
    /// single-node initial configuration if the log is empty.
    async fn get_membership_config(&self) -> Result<Configuration>;

    /// Get Raft's state information from storage, for use at startup.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a contiguous range of log entries, `[range.start, range.end)`.
    async fn get_log_entries(&self, range: Range<LogIndex>) -> Result<Vec<Entry<D>>>;

    /// Returns the last known log id, or a zero `LogId` if the log is empty.
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all log entries with index `>= start`, used to remove entries
    /// that conflict with a new leader's log.
    async fn delete_logs_from(&self, start: LogIndex) -> Result<()>;

    /// Append a batch of entries to the log. Entries are always presented in
    /// order and with contiguous indexes.
    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<()>;

    /// Apply a batch of already-committed entries to the state machine,
    /// returning one outcome per entry in order.
    async fn apply_to_state_machine(&self, entries: &[Entry<D>]) -> Result<Vec<ApplyOutcome<R>>>;

    /// Evaluate a read-only query against the current state machine state
    /// without appending anything to the log. Never called until the
    /// caller has independently satisfied the requested consistency level.
    async fn query_state_machine(&self, session_id: SessionId, data: &D) -> Result<R>;

    /// The session table backing this state machine, exposed for concurrent
    /// read access from the transport layer (e.g. to resolve a client's
    /// last known address).
    fn sessions(&self) -> &SessionTable;

    /// Re-evaluate every open session's staleness against `now` and mark
    /// any that have missed their keep-alive window `Unstable` (§4.5). The
    /// leader's reaper calls this at the top of every reap pass, before
    /// asking which sessions need an expiry entry appended.
    async fn poll_session_timeouts(&self, now: Timestamp) -> Result<()>;
}

/// APIs for inspecting a store in tests.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    async fn get_state_machine(&self) -> SM;
    async fn read_hard_state(&self) -> Option<HardState>;
}
