//! The Appender: one task per follower, replicating log entries and driving
//! heartbeats (§4.2).
//!
//! Simplified from the teacher's replication stream: there is no
//! line-rate/lagging state split and no snapshot streaming, since log
//! compaction and snapshot transfer are out of scope. Each Appender holds a
//! `next_index`/`match_index` pair, replicates whatever is outstanding on a
//! fixed heartbeat cadence, and falls back by one entry on every rejected
//! `AppendEntries` using the responder's `conflict_opt` to skip back further
//! when possible.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::storage::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// Replication progress reported back to the leader after every round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplicationMetrics {
    pub match_index: u64,
    pub last_log_id: LogId,
    /// When this Appender last heard back from its target at all, success
    /// or rejection — absent if it has never gotten a response.
    pub last_contact: Option<Instant>,
}

/// Events flowing from the leader into a running Appender.
pub(crate) enum RaftEvent {
    /// The leader appended new entries; replication should pick them up on
    /// its next round rather than waiting out the rest of the heartbeat
    /// interval.
    Revisit,
    /// The leader's commit index moved forward.
    UpdateCommitIndex { commit_index: u64 },
    /// The leader is stepping down or this target is being removed.
    Terminate,
}

/// Events flowing from a running Appender back to the leader.
pub(crate) enum ReplicaEvent {
    /// A batch was accepted; `match_index` moved forward.
    Updated { target: NodeId, metrics: ReplicationMetrics },
    /// The target reported a higher term than ours; the leader must step
    /// down.
    HigherTerm { term: u64 },
}

/// The public handle a leader holds to a running Appender task.
pub(crate) struct ReplicationStream {
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<D, R, N, S>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log_id: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self
    where
        D: AppData,
        R: AppDataResponse,
        N: RaftNetwork<D>,
        S: RaftStorage<D, R>,
    {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let core = AppenderTask {
            id,
            target,
            term,
            config,
            network,
            storage,
            raft_core_tx,
            repl_rx,
            next_index: last_log_id.index + 1,
            match_index: 0,
            matched_log_id: LogId::default(),
            commit_index,
            last_contact: None,
            marker: std::marker::PhantomData::<(D, R)>,
        };
        tokio::spawn(core.run().instrument(tracing::debug_span!("appender", target)));
        Self { repl_tx }
    }
}

struct AppenderTask<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    id: NodeId,
    target: NodeId,
    term: u64,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    /// Index of the next entry to send to this target.
    next_index: u64,
    /// Highest index known to be replicated to this target.
    match_index: u64,
    matched_log_id: LogId,
    /// The leader's commit index as of the last time it was communicated.
    commit_index: u64,
    /// When this target last answered an `AppendEntries` at all, whether it
    /// accepted or rejected the round.
    last_contact: Option<Instant>,

    marker: std::marker::PhantomData<(D, R)>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> AppenderTask<D, R, N, S> {
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, target = self.target))]
    async fn run(mut self) {
        let mut ticker = interval(Duration::from_millis(self.config.heartbeat_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.send_append_entries().await {
                        return;
                    }
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some((RaftEvent::Revisit, _)) => {
                            if !self.send_append_entries().await {
                                return;
                            }
                        }
                        Some((RaftEvent::UpdateCommitIndex { commit_index }, _)) => {
                            self.update_commit_index(commit_index);
                        }
                        Some((RaftEvent::Terminate, _)) | None => return,
                    }
                }
            }
        }
    }

    /// Send whatever is outstanding for `next_index` onward, bounded by
    /// `max_payload_entries`. Returns `false` if the Appender should stop
    /// (the leader channel is gone, or a higher term was observed).
    async fn send_append_entries(&mut self) -> bool {
        let prev_log_id = self.prev_log_id().await;
        let entries = match self
            .storage
            .get_log_entries(self.next_index..self.next_index + self.config.max_payload_entries)
            .await
        {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(error = %err, "appender failed to read log entries");
                return false;
            }
        };

        let sent_up_to = entries.last().map(|e| e.log_id).unwrap_or(prev_log_id);

        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };

        let rpc_summary = rpc.summary();
        let res = timeout(Duration::from_millis(self.config.heartbeat_interval * 3), self.network.send_append_entries(self.target, rpc)).await;

        let resp = match res {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, target = self.target, rpc = %rpc_summary, "appender RPC failed");
                return true;
            }
            Err(_) => {
                tracing::warn!(target = self.target, "appender RPC timed out");
                return true;
            }
        };

        if resp.term > self.term {
            let _ = self.raft_core_tx.send((ReplicaEvent::HigherTerm { term: resp.term }, tracing::debug_span!("CH")));
            return false;
        }

        self.last_contact = Some(Instant::now());

        if resp.success {
            self.advance_on_success(sent_up_to);
        } else {
            if let Some(conflict) = resp.conflict_opt {
                self.next_index = conflict.log_id.index + 1;
            } else {
                self.next_index = self.next_index.saturating_sub(1).max(1);
            }
            self.report_progress();
        }

        true
    }

    /// Advance progress to `sent_up_to`, the log id of the last entry
    /// actually included in the round that was just acknowledged — never to
    /// the leader's current `last_log_id`, which may have moved further
    /// ahead than what this target was sent if the backlog exceeded
    /// `max_payload_entries`.
    fn advance_on_success(&mut self, sent_up_to: LogId) {
        self.matched_log_id = sent_up_to;
        self.match_index = sent_up_to.index;
        self.next_index = sent_up_to.index + 1;
        self.report_progress();
    }

    fn report_progress(&self) {
        let _ = self.raft_core_tx.send((
            ReplicaEvent::Updated {
                target: self.target,
                metrics: ReplicationMetrics { match_index: self.match_index, last_log_id: self.matched_log_id, last_contact: self.last_contact },
            },
            tracing::debug_span!("CH"),
        ));
    }

    async fn prev_log_id(&self) -> LogId {
        if self.next_index <= 1 {
            return LogId::default();
        }
        let idx = self.next_index - 1;
        match self.storage.get_log_entries(idx..self.next_index).await {
            Ok(entries) => entries.first().map(|e: &Entry<D>| e.log_id).unwrap_or_default(),
            Err(_) => LogId::default(),
        }
    }

    pub(crate) fn update_commit_index(&mut self, commit_index: u64) {
        self.commit_index = commit_index;
    }
}
