//! Error taxonomy for the leader role and its collaborators.
//!
//! Mirrors the teacher's split between a top-level `RaftError` for
//! infrastructure failures (storage, channel shutdown) and narrower
//! per-operation error enums returned alongside a successful RPC so callers
//! can distinguish "your request was rejected" from "the node is gone".

use crate::storage::AppError;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// Errors which can occur while the `RaftCore` is running.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("error from storage: {0}")]
    RaftStorage(#[from] anyhow::Error),

    #[error("raft is already initialized with a known cluster state")]
    InitializeError(#[from] InitializeError),

    #[error("the node is shutting down")]
    ShuttingDown,
}

/// Error returned by `Raft::initialize`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InitializeError {
    #[error("the cluster is already initialized, or has known state which prevents initialization")]
    NotAllowed,

    #[error("raft is shutting down: {0}")]
    Fatal(String),
}

impl From<RaftError> for InitializeError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::InitializeError(e) => e,
            other => InitializeError::Fatal(other.to_string()),
        }
    }
}

/// Error returned from a client write (`command`, `register`, `connect`,
/// `keep_alive`, `unregister`, or a membership change) which was not
/// applied.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientWriteError {
    #[error("this node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),

    #[error("the request was dropped without being committed, which may indicate the entry was lost to a new leader's conflicting entries")]
    EntryNotCommitted,

    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The command was applied, but the application rejected it; the error
    /// kind is surfaced verbatim (§7) rather than being folded into a fatal
    /// shutdown.
    #[error(transparent)]
    Application(#[from] AppError),

    #[error("raft is shutting down: {0}")]
    Fatal(String),
}

impl From<RaftError> for ClientWriteError {
    fn from(err: RaftError) -> Self {
        ClientWriteError::Fatal(err.to_string())
    }
}

/// Error returned from a client read (`query`).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientReadError {
    #[error("this node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),

    #[error("could not confirm leadership within the current lease period; a fresh round of heartbeats was required but a quorum did not respond in time")]
    QuorumNotReached,

    #[error("this leader has not yet committed its Initialize entry for the current term")]
    Initializing,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("raft is shutting down: {0}")]
    Fatal(String),
}

impl From<RaftError> for ClientReadError {
    fn from(err: RaftError) -> Self {
        ClientReadError::Fatal(err.to_string())
    }
}

/// Error returned from `Raft::change_membership` or an internal join/leave
/// request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChangeConfigError {
    #[error("this node is not the Raft leader")]
    ForwardToLeader(Option<NodeId>),

    #[error("a configuration change is already in progress")]
    ConfigurationInProgress,

    #[error("the proposed configuration change does not extend the currently active configuration")]
    IllegalConfiguration,

    #[error("refusing to remove the last voting member of the cluster")]
    LastVoterRemoval,

    #[error("raft is shutting down: {0}")]
    Fatal(String),
}

impl From<RaftError> for ChangeConfigError {
    fn from(err: RaftError) -> Self {
        ChangeConfigError::Fatal(err.to_string())
    }
}

/// Error returned for a session-scoped request (`query`, `keep_alive`,
/// `unregister`) naming a session the state machine does not know about.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(crate::SessionId),

    #[error("session {0} has already been closed")]
    SessionClosed(crate::SessionId),
}

/// Why a response to an already-applied entry could not be delivered to its
/// original caller. Not surfaced to clients; used only for logging when the
/// leader steps down with entries still `awaiting_committed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("the entry at index {0} was overwritten by a new leader before it was committed")]
    Overwritten(LogIndex),

    #[error("this node stepped down from term {0} before the entry was committed")]
    SteppedDown(Term),
}
