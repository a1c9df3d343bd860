//! An implementation of the leader role of a Raft-style replicated session
//! server: log replication, commit tracking, per-session request ordering,
//! session expiry, and safe single-step cluster reconfiguration.
//!
//! The surrounding Raft roles (follower, candidate, non-voter) are
//! implemented only to the depth needed to drive this crate's own tests and
//! to give the leader somewhere to step down to; the hard engineering here
//! is in [`core::leader`].

pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod quorum;
pub mod raft;
pub mod replication;
pub mod storage;

pub use crate::config::Config;
pub use crate::core::Role;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::raft::Raft;
pub use crate::storage::RaftStorage;

/// Stable identifier of a cluster server. Aliased as `NodeId` in code that
/// talks about wire-level peers and as `MemberId` in code that talks about
/// cluster membership; both names refer to the same `u64`.
pub type MemberId = u64;
pub type NodeId = MemberId;

/// Monotonically increasing election epoch.
pub type Term = u64;

/// 1-based position in the replicated log. `0` denotes "none".
pub type LogIndex = u64;

/// Opaque 128-bit client identifier.
pub type ClientId = u128;

/// Assigned by the state machine on session registration.
pub type SessionId = u64;

/// Per-session monotonically increasing operation sequence chosen by the
/// client.
pub type Sequence = u64;

/// Milliseconds since the Unix epoch. Entries are timestamped with this
/// rather than `std::time::Instant` so that they can be serialized and
/// replicated.
pub type Timestamp = u64;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// The identity of the (term, index) pair which uniquely names a log entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A marker trait for application-specific command payloads carried inside
/// [`storage::EntryPayload::Command`].
///
/// This is the same role `AppData` plays in the teacher: the leader never
/// inspects the payload, it only replicates and hands it to the state
/// machine on apply.
pub trait AppData: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {}
impl<T> AppData for T where T: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {}

/// A marker trait for the value an application's state machine produces in
/// response to a `Command`.
pub trait AppDataResponse: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {}
impl<T> AppDataResponse for T where T: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {}

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A `RaftNetwork` implementation is responsible for sending RPCs to peer
/// nodes. It is the transport collaborator named in §1 as out of scope for
/// rewrite; this crate only depends on its interface.
#[async_trait::async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: raft::AppendEntriesRequest<D>,
    ) -> anyhow::Result<raft::AppendEntriesResponse>;

    async fn send_vote(&self, target: NodeId, rpc: raft::VoteRequest) -> anyhow::Result<raft::VoteResponse>;
}

/// Renders a short human-readable summary of a message, used for `tracing`
/// fields instead of the full `Debug` dump.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Whether a caller wants the current value of something or is supplying a
/// freshly computed replacement. Mirrors the teacher's `metrics::Update`.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
