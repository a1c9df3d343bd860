//! Metrics for observing the state of a Raft node, streamed out over a
//! `tokio::sync::watch` channel the same way the teacher exposes them.
//!
//! Consumers call `Raft::metrics()` to get a `watch::Receiver<RaftMetrics>`
//! and `await`/`borrow` it like any other watch channel, or use [`Wait`] to
//! block until a predicate holds.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::Role;
use crate::LogId;
use crate::NodeId;
use crate::Term;

/// A snapshot of a Raft node's state, emitted any time that state changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: RoleMetric,
    pub current_term: Term,
    pub last_log_index: crate::LogIndex,
    pub last_applied: crate::LogIndex,
    pub current_leader: Option<NodeId>,
    pub membership_config: crate::storage::Configuration,
    /// Present only while `state == RoleMetric::Leader`.
    pub leader_metrics: Option<LeaderMetrics>,
}

/// Mirrors `core::Role` but without payload, so it derives `PartialEq` and
/// cheaply fits in `RaftMetrics`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleMetric {
    NonVoter,
    Follower,
    Candidate,
    Leader,
}

impl Default for RoleMetric {
    fn default() -> Self {
        RoleMetric::Follower
    }
}

impl From<&Role> for RoleMetric {
    fn from(role: &Role) -> Self {
        match role {
            Role::NonVoter => RoleMetric::NonVoter,
            Role::Follower => RoleMetric::Follower,
            Role::Candidate => RoleMetric::Candidate,
            Role::Leader => RoleMetric::Leader,
        }
    }
}

/// Leader-only metrics: per-peer replication progress and session table
/// summary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
    pub sessions: SessionMetrics,
}

/// Replication progress for a single follower, as tracked by its Appender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub match_index: crate::LogIndex,
    pub last_log_id: LogId,
    /// True once this follower has gone longer than
    /// `Config::replication_lag_threshold` without a successful or rejected
    /// `AppendEntries` round-trip — including if it has never answered one
    /// at all.
    pub lagging: bool,
}

/// Aggregate counts over the session table, refreshed on every reaper pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionMetrics {
    pub open: usize,
    pub unstable: usize,
    pub expired_total: u64,
}

/// Blocks a caller until a `watch::Receiver<RaftMetrics>` satisfies a
/// predicate, or a timeout elapses. Grounded in the teacher's `Wait` helper.
pub struct Wait(pub watch::Receiver<RaftMetrics>, pub Duration);

impl Wait {
    pub async fn metrics<T>(
        &self,
        mut func: T,
        msg: impl Into<String>,
    ) -> Result<RaftMetrics, WaitError>
    where
        T: FnMut(&RaftMetrics) -> bool,
    {
        let msg = msg.into();
        let mut rx = self.0.clone();
        let fut = async {
            loop {
                {
                    let latest = rx.borrow();
                    if func(&latest) {
                        return latest.clone();
                    }
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };

        timeout(self.1, fut).await.map_err(|_| WaitError::Timeout(self.1, msg))
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout ({0:?}) while waiting for condition: {1}")]
    Timeout(Duration, String),
}
