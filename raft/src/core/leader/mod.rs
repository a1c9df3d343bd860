//! The leader role (§4.1): opening and closing a term of leadership, driving
//! replication and commit-index advancement, delivering client responses
//! once an entry is both committed and applied, and the session- and
//! configuration-scoped collaborators that gate those operations.

mod config_coordinator;
mod reaper;
mod sequencer;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;

use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::SessionError;
use crate::metrics::LeaderMetrics;
use crate::metrics::ReplicationMetrics as PublicReplicationMetrics;
use crate::metrics::SessionMetrics;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::ConnectRequest;
use crate::raft::KeepAliveRequest;
use crate::raft::KeepAliveResponse;
use crate::raft::PollResponse;
use crate::raft::QueryRequest;
use crate::raft::RaftMsg;
use crate::raft::ReconfigureRequest;
use crate::raft::RegisterRequest;
use crate::raft::RegisterResponse;
use crate::raft::RespTx;
use crate::raft::UnregisterRequest;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::ApplyOutcome;
use crate::storage::Configuration;
use crate::storage::EntryPayload;
use crate::storage::Member;
use crate::storage::ReadConsistency;
use crate::AppData;
use crate::AppDataResponse;
use crate::ClientId;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::SessionId;
use crate::Update;

use config_coordinator::ConfigCoordinatorState;
use sequencer::PendingCommand;
use sequencer::PendingQuery;
use sequencer::SequencerState;

/// What the leader is waiting to hear back about, keyed by the log index of
/// the entry it appended. Absent entirely for entries no client is waiting
/// on (the per-term `Initialize` no-op, the founding `Configuration`, and
/// reaper-issued expirations).
enum Awaiting<R: AppDataResponse> {
    Command(RespTx<CommandResponse<R>, ClientWriteError>),
    Register { timeout_millis: u64, tx: RespTx<RegisterResponse, ClientWriteError> },
    Connect(RespTx<(), ClientWriteError>),
    KeepAlive(RespTx<KeepAliveResponse, ClientWriteError>),
    Unregister(RespTx<(), ClientWriteError>),
    ConfigChange(RespTx<(), ChangeConfigError>),
}

/// Drives a single term of leadership: owns the per-follower Appenders, the
/// per-session sequencers, the ConfigCoordinator, and the map of entries
/// awaiting delivery once committed and applied. Dropped, and a fresh one
/// constructed, every time this node becomes leader again.
pub struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    nodes: BTreeMap<NodeId, ReplicationStream>,
    match_indexes: BTreeMap<NodeId, u64>,
    /// Last time each Appender heard back from its target at all, used to
    /// flag a follower as lagging in `LeaderMetrics` once it exceeds
    /// `Config::replication_lag_threshold`.
    last_contact: BTreeMap<NodeId, Instant>,
    replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    config_coordinator: ConfigCoordinatorState,
    /// The log id of the last `Configuration` entry applied, used as the
    /// "current configuration identity" a `reconfigure` caller must still
    /// agree with (§9 Open Question 1).
    configuration_log_id: LogId,
    /// Index of this term's `Initialize` entry (`I0` in §4.1/§4.3), or `0`
    /// before it has even been appended. `initializing()` derives from this
    /// plus the current commit index (§4.3, §9 Open Question 2).
    initialize_index: u64,
    sequencers: BTreeMap<SessionId, SequencerState<D, R>>,
    awaiting: BTreeMap<u64, Awaiting<R>>,
    /// Valid until this `Instant`, a `LinearizableLease` read may be served
    /// without a fresh heartbeat round, on the strength of the last quorum
    /// acknowledgment observed.
    lease_until: Option<Instant>,
    expired_total: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    pub(crate) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            match_indexes: BTreeMap::new(),
            last_contact: BTreeMap::new(),
            replication_tx,
            replication_rx,
            config_coordinator: ConfigCoordinatorState::default(),
            configuration_log_id: LogId::default(),
            initialize_index: 0,
            sequencers: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            lease_until: None,
            expired_total: 0,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.id, term = self.core.current_term))]
    pub(crate) async fn run(mut self) -> Result<(), RaftError> {
        self.open().await?;

        let mut reaper_ticker = interval(Duration::from_millis(self.core.config.heartbeat_interval * 4));
        let reap_on_tick = self.core.config.session_reap_check;

        let result: Result<(), RaftError> = loop {
            if !self.core.target_role.is_leader() {
                break Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    if let Err(err) = self.handle_msg(msg).await {
                        break Err(err);
                    }
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    if let Err(err) = self.handle_replica_event(event).await {
                        break Err(err);
                    }
                }
                _ = reaper_ticker.tick(), if reap_on_tick => {
                    if let Err(err) = self.reap_expired_sessions().await {
                        break Err(err);
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        };

        self.close();
        result
    }

    /// Entered exactly once per term of leadership (§4.1): claim the
    /// leader slot, start replicating to every other member, and commit the
    /// per-term no-op plus the founding configuration so that a later
    /// reader of the log can always tell who led which term and under what
    /// membership.
    async fn open(&mut self) -> Result<(), RaftError> {
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.set_target_role(Role::Leader);

        let peers: Vec<NodeId> = self.core.membership.members.keys().copied().filter(|id| *id != self.core.id).collect();
        for id in peers {
            self.spawn_appender(id);
        }

        for session in self.core.storage.sessions().all().await {
            self.sequencers.insert(session.id, SequencerState::new(session.last_command_sequence, session.last_command_sequence));
        }

        self.lease_until = Some(Instant::now() + Duration::from_millis(self.core.config.election_timeout_min));

        let membership = self.core.membership.clone();
        let ids = self.append_entries(vec![EntryPayload::Initialize, EntryPayload::Configuration(membership)]).await?;
        self.initialize_index = ids[0].index;
        self.advance_commit_index().await?;

        self.report_leader_metrics().await;
        Ok(())
    }

    /// True until this term's `Initialize` entry has committed (§4.3,
    /// Invariant 1). No configuration change may be initiated, and no query
    /// of any consistency mode may be served, while this holds (§9 Open
    /// Question 2 resolves the unspecified case against serving early).
    fn initializing(&self) -> bool {
        self.initialize_index == 0 || self.core.commit_index < self.initialize_index
    }

    /// Left on every exit from [`run`], whether from a graceful shutdown or
    /// stepping down on a higher term: tear down replication and answer
    /// every outstanding caller rather than leaving it hanging.
    fn close(mut self) {
        for (_, stream) in self.nodes.drain() {
            let _ = stream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
        }
        if self.core.current_leader == Some(self.core.id) {
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }
        if self.core.target_role == Role::Leader {
            self.core.set_target_role(Role::Follower);
        }
        self.fail_all_awaiting();
        self.core.report_metrics(Update::Update(None));
    }

    fn fail_all_awaiting(&mut self) {
        let current_leader = self.core.current_leader;
        for (_, awaiting) in std::mem::take(&mut self.awaiting) {
            match awaiting {
                Awaiting::Command(tx) => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
                }
                Awaiting::Register { tx, .. } => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
                }
                Awaiting::Connect(tx) => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
                }
                Awaiting::KeepAlive(tx) => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
                }
                Awaiting::Unregister(tx) => {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
                }
                Awaiting::ConfigChange(tx) => {
                    let _ = tx.send(Err(ChangeConfigError::ForwardToLeader(current_leader)));
                }
            }
        }
        for seq in self.sequencers.values_mut() {
            for (_, pending) in std::mem::take(&mut seq.pending_requests) {
                let _ = pending.tx.send(Err(ClientWriteError::ForwardToLeader(current_leader)));
            }
            for (_, pending_vec) in std::mem::take(&mut seq.pending_queries) {
                for pending in pending_vec {
                    let _ = pending.tx.send(Err(ClientReadError::ForwardToLeader(current_leader)));
                }
            }
        }
    }

    fn spawn_appender(&mut self, target: NodeId) {
        let stream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        self.nodes.insert(target, stream);
    }

    /// Add or remove Appenders so that they track the active configuration,
    /// called after every `Configuration` entry applies.
    fn reconcile_replication_streams(&mut self) {
        let members: BTreeSet<NodeId> = self.core.membership.members.keys().copied().collect();

        let departed: Vec<NodeId> = self.nodes.keys().copied().filter(|id| !members.contains(id)).collect();
        for id in departed {
            if let Some(stream) = self.nodes.remove(&id) {
                let _ = stream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
            }
            self.match_indexes.remove(&id);
        }

        for id in members {
            if id != self.core.id && !self.nodes.contains_key(&id) {
                self.spawn_appender(id);
            }
        }
    }

    async fn report_leader_metrics(&mut self) {
        let open = self.core.storage.sessions().open_count().await;
        let unstable = self.core.storage.sessions().unstable_count().await;
        let lag_threshold = Duration::from_millis(self.core.config.replication_lag_threshold);
        let replication = self
            .match_indexes
            .iter()
            .map(|(id, index)| {
                let lagging = match self.last_contact.get(id) {
                    Some(last) => last.elapsed() > lag_threshold,
                    None => true,
                };
                (*id, PublicReplicationMetrics { match_index: *index, last_log_id: LogId { term: self.core.current_term, index: *index }, lagging })
            })
            .collect();
        let metrics = LeaderMetrics { replication, sessions: SessionMetrics { open, unstable, expired_total: self.expired_total } };
        self.core.report_metrics(Update::Update(Some(&metrics)));
    }

    fn lease_valid(&self) -> bool {
        self.lease_until.map(|t| Instant::now() < t).unwrap_or(false)
    }

    //////////////////////////////////////////////////////////////////////
    // Inbound message dispatch

    async fn handle_msg(&mut self, msg: RaftMsg<D, R>) -> Result<(), RaftError> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => match self.core.handle_append_entries_request(rpc).await {
                Ok(resp) => {
                    let _ = tx.send(Ok(resp));
                    Ok(())
                }
                Err(err) => {
                    let _ = tx.send(Err(RaftError::ShuttingDown));
                    Err(err)
                }
            },
            RaftMsg::RequestVote { rpc, tx } => match self.core.handle_vote_request(rpc).await {
                Ok(resp) => {
                    let _ = tx.send(Ok(resp));
                    Ok(())
                }
                Err(err) => {
                    let _ = tx.send(Err(RaftError::ShuttingDown));
                    Err(err)
                }
            },
            RaftMsg::Poll { tx, .. } => {
                let _ = tx.send(Ok(PollResponse { term: self.core.current_term, accepted: false }));
                Ok(())
            }
            RaftMsg::Command { rpc, tx } => self.handle_command(rpc, tx).await,
            RaftMsg::Query { rpc, tx } => self.handle_query(rpc, tx).await,
            RaftMsg::Register { rpc, tx } => self.handle_register(rpc, tx).await,
            RaftMsg::Connect { rpc, tx } => self.handle_connect(rpc, tx).await,
            RaftMsg::KeepAlive { rpc, tx } => self.handle_keep_alive(rpc, tx).await,
            RaftMsg::Unregister { rpc, tx } => self.handle_unregister(rpc, tx).await,
            RaftMsg::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
                Ok(())
            }
            RaftMsg::Join { member, tx } => self.handle_join(member, tx).await,
            RaftMsg::Leave { member, tx } => self.handle_leave(member, tx).await,
            RaftMsg::Reconfigure { rpc, tx } => self.handle_reconfigure(rpc, tx).await,
        }
    }

    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> Result<(), RaftError> {
        match event {
            ReplicaEvent::Updated { target, metrics } => {
                self.match_indexes.insert(target, metrics.match_index);
                if let Some(last_contact) = metrics.last_contact {
                    self.last_contact.insert(target, last_contact);
                }
                self.advance_commit_index().await
            }
            ReplicaEvent::HigherTerm { term } => {
                self.core.update_current_term(term, None);
                self.core.set_target_role(Role::Follower);
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.save_hard_state().await
            }
        }
    }

    //////////////////////////////////////////////////////////////////////
    // Replication and commit

    /// Append one or more new entries at the end of the log, at the
    /// leader's current term, and prod every Appender to revisit its
    /// target so the new entries go out promptly.
    ///
    /// Deliberately does **not** advance the commit index itself: in a
    /// single-node cluster (or any cluster where the new entry already
    /// satisfies quorum against this node's own match index) that would
    /// commit and apply the entry — and deliver its response — before the
    /// caller has had a chance to record what it's waiting on. Every caller
    /// must register its `awaiting` entry (or the `ConfigCoordinator`'s
    /// `configuring` latch) against the returned log id *before* calling
    /// `advance_commit_index` itself.
    async fn append_entries(&mut self, payloads: Vec<EntryPayload<D>>) -> Result<Vec<LogId>, RaftError> {
        let start = self.core.last_log_id.index + 1;
        let term = self.core.current_term;
        let entries: Vec<crate::storage::Entry<D>> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| crate::storage::Entry { log_id: LogId { term, index: start + i as u64 }, payload })
            .collect();

        self.core.storage.append_to_log(&entries).await.map_err(|err| self.core.map_fatal_storage_error(err))?;

        let ids: Vec<LogId> = entries.iter().map(|e| e.log_id).collect();
        self.core.last_log_id = *ids.last().expect("append_entries called with at least one payload");

        for stream in self.nodes.values() {
            let _ = stream.repl_tx.send((RaftEvent::Revisit, tracing::debug_span!("CH")));
        }

        Ok(ids)
    }

    async fn append_one(&mut self, payload: EntryPayload<D>) -> Result<LogId, RaftError> {
        let mut ids = self.append_entries(vec![payload]).await?;
        Ok(ids.remove(0))
    }

    /// Recompute the commit index from every voter's match index (including
    /// this node's own) and, if it moved forward, apply everything newly
    /// committed. Only entries from the current term are ever counted as
    /// committed, per the usual Raft safety rule against a new leader
    /// silently committing a predecessor's uncommitted entries.
    async fn advance_commit_index(&mut self) -> Result<(), RaftError> {
        let voters = self.core.membership.voters();
        let indexes: Vec<u64> = voters
            .iter()
            .map(|id| if *id == self.core.id { self.core.last_log_id.index } else { *self.match_indexes.get(id).unwrap_or(&0) })
            .collect();
        let candidate = quorum::commit_index_of(indexes);

        if candidate > self.core.commit_index {
            if self.log_term_at(candidate).await? == Some(self.core.current_term) {
                self.core.commit_index = candidate;
                self.lease_until = Some(Instant::now() + Duration::from_millis(self.core.config.election_timeout_min));
                self.notify_appenders_commit_index();
                self.apply_committed().await?;
            }
        }
        Ok(())
    }

    async fn log_term_at(&mut self, index: u64) -> Result<Option<u64>, RaftError> {
        if index == 0 {
            return Ok(None);
        }
        let entries = self.core.storage.get_log_entries(index..index + 1).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        Ok(entries.first().map(|e| e.log_id.term))
    }

    fn notify_appenders_commit_index(&self) {
        for stream in self.nodes.values() {
            let _ = stream.repl_tx.send((RaftEvent::UpdateCommitIndex { commit_index: self.core.commit_index }, tracing::debug_span!("CH")));
        }
    }

    async fn apply_committed(&mut self) -> Result<(), RaftError> {
        if self.core.commit_index <= self.core.last_applied.index {
            return Ok(());
        }
        let start = self.core.last_applied.index + 1;
        let end = self.core.commit_index + 1;
        let entries = self.core.storage.get_log_entries(start..end).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        if entries.is_empty() {
            return Ok(());
        }
        let last_log_id = entries.last().expect("checked non-empty above").log_id;
        let outcomes = self.core.storage.apply_to_state_machine(&entries).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = last_log_id;

        for (entry, outcome) in entries.iter().zip(outcomes.into_iter()) {
            self.deliver_response(entry.log_id, &entry.payload, outcome).await?;
        }

        self.report_leader_metrics().await;
        Ok(())
    }

    /// Resolve whatever is waiting on `log_id`, and run the bookkeeping
    /// every entry of that kind always needs regardless of whether anyone
    /// is actually waiting (membership updates, session table changes,
    /// waking gated queries).
    async fn deliver_response(&mut self, log_id: LogId, payload: &EntryPayload<D>, outcome: ApplyOutcome<R>) -> Result<(), RaftError> {
        let index = log_id.index;
        let notify = self.awaiting.remove(&index);

        match payload {
            EntryPayload::Initialize => {}

            EntryPayload::Configuration(cfg) => {
                self.core.update_membership(cfg.clone());
                self.configuration_log_id = log_id;
                self.config_coordinator.configuring = 0;
                self.reconcile_replication_streams();
                if let Some(Awaiting::ConfigChange(tx)) = notify {
                    let _ = tx.send(Ok(()));
                }
            }

            EntryPayload::Command { session_id, sequence, .. } => {
                if let ApplyOutcome::Command(result) = outcome {
                    let mapped = result.map(|data| CommandResponse { index, data });
                    if let Some(seq) = self.sequencers.get_mut(session_id) {
                        seq.record_response(*sequence, mapped.clone());
                    }
                    if let Some(Awaiting::Command(tx)) = notify {
                        let _ = tx.send(mapped.map_err(ClientWriteError::Application));
                    }
                }
                self.run_ready_queries(*session_id).await?;
            }

            EntryPayload::Register { .. } => {
                if let ApplyOutcome::Registered(session_id) = outcome {
                    self.sequencers.insert(session_id, SequencerState::new(0, 0));
                    if let Some(Awaiting::Register { timeout_millis, tx }) = notify {
                        let _ = tx.send(Ok(RegisterResponse { session_id, timeout_millis }));
                    }
                }
            }

            EntryPayload::Connect { .. } => {
                if let Some(Awaiting::Connect(tx)) = notify {
                    let _ = tx.send(Ok(()));
                }
            }

            EntryPayload::KeepAlive { session_id, command_sequence, .. } => {
                if let Some(Awaiting::KeepAlive(tx)) = notify {
                    let members = self.core.membership.voters().into_iter().collect();
                    let _ = tx.send(Ok(KeepAliveResponse { leader_id: Some(self.core.id), members }));
                }
                // The client has acknowledged every response up to its own
                // reported commandSequence; it will never retry those, so
                // the dedup cache no longer needs to retain them.
                if let Some(seq) = self.sequencers.get_mut(session_id) {
                    seq.prune_responses_below(*command_sequence);
                }
                self.run_ready_queries(*session_id).await?;
            }

            EntryPayload::Unregister { session_id, .. } => {
                self.sequencers.remove(session_id);
                if let Some(Awaiting::Unregister(tx)) = notify {
                    let _ = tx.send(Ok(()));
                }
            }
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////
    // Client commands and queries (§4.1, §4.4, §6)

    async fn client_id_for(&self, session_id: SessionId) -> ClientId {
        self.core.storage.sessions().get(session_id).await.map(|s| s.client_id).unwrap_or(0)
    }

    async fn handle_command(&mut self, rpc: CommandRequest<D>, tx: RespTx<CommandResponse<R>, ClientWriteError>) -> Result<(), RaftError> {
        let session_id = rpc.session_id;
        let sequencer = match self.sequencers.get_mut(&session_id) {
            Some(s) => s,
            None => {
                let _ = tx.send(Err(ClientWriteError::Session(SessionError::UnknownSession(session_id))));
                return Ok(());
            }
        };

        if let Some(cached) = sequencer.cached_response(rpc.sequence) {
            let _ = tx.send(cached.map_err(ClientWriteError::Application));
            return Ok(());
        }

        if sequencer.must_enqueue_request(rpc.sequence) {
            sequencer.pending_requests.insert(rpc.sequence, PendingCommand { req: rpc, tx });
            return Ok(());
        }

        sequencer.request_sequence = sequencer.request_sequence.max(rpc.sequence);
        self.append_command(rpc, tx).await?;

        let ready = match self.sequencers.get_mut(&session_id) {
            Some(s) => s.drain_ready_requests(),
            None => Vec::new(),
        };
        for pending in ready {
            self.append_command(pending.req, pending.tx).await?;
        }
        Ok(())
    }

    async fn append_command(&mut self, rpc: CommandRequest<D>, tx: RespTx<CommandResponse<R>, ClientWriteError>) -> Result<(), RaftError> {
        let client_id = self.client_id_for(rpc.session_id).await;
        let payload = EntryPayload::Command { client_id, session_id: rpc.session_id, sequence: rpc.sequence, data: rpc.data };
        let log_id = self.append_one(payload).await?;
        self.awaiting.insert(log_id.index, Awaiting::Command(tx));
        self.advance_commit_index().await?;
        Ok(())
    }

    async fn handle_query(&mut self, rpc: QueryRequest<D>, tx: RespTx<CommandResponse<R>, ClientReadError>) -> Result<(), RaftError> {
        let session_id = rpc.session_id;
        if !self.sequencers.contains_key(&session_id) {
            let _ = tx.send(Err(ClientReadError::Session(SessionError::UnknownSession(session_id))));
            return Ok(());
        }
        if self.initializing() {
            let _ = tx.send(Err(ClientReadError::Initializing));
            return Ok(());
        }

        match rpc.consistency {
            ReadConsistency::Sequential => self.gate_and_run_query(rpc, tx).await,
            ReadConsistency::LinearizableLease => {
                if self.lease_valid() {
                    self.gate_and_run_query(rpc, tx).await
                } else if self.confirm_leadership_quorum().await? {
                    self.gate_and_run_query(rpc, tx).await
                } else {
                    let _ = tx.send(Err(ClientReadError::QuorumNotReached));
                    Ok(())
                }
            }
            ReadConsistency::Linearizable => {
                if self.confirm_leadership_quorum().await? {
                    self.gate_and_run_query(rpc, tx).await
                } else {
                    let _ = tx.send(Err(ClientReadError::QuorumNotReached));
                    Ok(())
                }
            }
        }
    }

    /// Send an empty `AppendEntries` round directly to every voter and wait
    /// for a majority to acknowledge at the current term, proving this node
    /// is still leader. Used to serve `Linearizable` reads, and as the
    /// fallback for `LinearizableLease` once the lease has expired.
    async fn confirm_leadership_quorum(&mut self) -> Result<bool, RaftError> {
        let voters: Vec<NodeId> = self.core.membership.voters().into_iter().filter(|id| *id != self.core.id).collect();
        if voters.is_empty() {
            return Ok(true);
        }

        let term = self.core.current_term;
        let leader_id = self.core.id;
        let prev_log_id = self.core.last_log_id;
        let commit_index = self.core.commit_index;
        let needed = quorum::majority_of(voters.len() + 1).saturating_sub(1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        for target in voters {
            let network = self.core.network.clone();
            let rpc = AppendEntriesRequest { term, leader_id, prev_log_id, entries: Vec::new(), leader_commit: commit_index };
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = network.send_append_entries(target, rpc).await;
                let _ = tx.send(res);
            });
        }
        drop(tx);

        let mut acked = 0usize;
        let deadline = tokio::time::sleep(Duration::from_millis(self.core.config.heartbeat_interval * 3));
        tokio::pin!(deadline);
        loop {
            if acked >= needed {
                break;
            }
            tokio::select! {
                res = rx.recv() => match res {
                    Some(Ok(resp)) if resp.term > term => {
                        self.core.update_current_term(resp.term, None);
                        self.core.set_target_role(Role::Follower);
                        self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                        self.core.save_hard_state().await?;
                        break;
                    }
                    Some(Ok(resp)) if resp.success => acked += 1,
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        if acked >= needed {
            self.lease_until = Some(Instant::now() + Duration::from_millis(self.core.config.election_timeout_min));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn gate_and_run_query(&mut self, rpc: QueryRequest<D>, tx: RespTx<CommandResponse<R>, ClientReadError>) -> Result<(), RaftError> {
        let session_id = rpc.session_id;
        let must_wait = self.sequencers.get(&session_id).map(|s| s.must_enqueue_query(rpc.sequence)).unwrap_or(false);
        if must_wait {
            if let Some(seq) = self.sequencers.get_mut(&session_id) {
                seq.enqueue_query(rpc.sequence, PendingQuery { req: rpc, tx });
            }
            return Ok(());
        }
        self.execute_query(PendingQuery { req: rpc, tx }).await
    }

    async fn run_ready_queries(&mut self, session_id: SessionId) -> Result<(), RaftError> {
        let ready = match self.sequencers.get_mut(&session_id) {
            Some(seq) => {
                let upto = seq.command_sequence;
                seq.drain_ready_queries(upto)
            }
            None => return Ok(()),
        };
        for pending in ready {
            self.execute_query(pending).await?;
        }
        Ok(())
    }

    async fn execute_query(&mut self, pending: PendingQuery<D, R>) -> Result<(), RaftError> {
        let data = self
            .core
            .storage
            .query_state_machine(pending.req.session_id, &pending.req.data)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let resp = CommandResponse { index: self.core.last_applied.index, data };
        let _ = pending.tx.send(Ok(resp));
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////
    // Session lifecycle (§4.1, §4.4, §6)

    async fn handle_register(&mut self, rpc: RegisterRequest, tx: RespTx<RegisterResponse, ClientWriteError>) -> Result<(), RaftError> {
        let timeout_millis = self.core.config.session_timeout_millis(rpc.timeout_millis);
        let payload = EntryPayload::Register { client_id: rpc.client_id, timeout_millis };
        let log_id = self.append_one(payload).await?;
        self.awaiting.insert(log_id.index, Awaiting::Register { timeout_millis, tx });
        self.advance_commit_index().await?;
        self.reap_expired_sessions().await
    }

    async fn handle_connect(&mut self, rpc: ConnectRequest, tx: RespTx<(), ClientWriteError>) -> Result<(), RaftError> {
        self.core.storage.sessions().bind_connection(rpc.client_id, rpc.address.clone()).await;
        let payload = EntryPayload::Connect { client_id: rpc.client_id, address: rpc.address };
        let log_id = self.append_one(payload).await?;
        self.awaiting.insert(log_id.index, Awaiting::Connect(tx));
        self.advance_commit_index().await?;
        self.reap_expired_sessions().await
    }

    async fn handle_keep_alive(&mut self, rpc: KeepAliveRequest, tx: RespTx<KeepAliveResponse, ClientWriteError>) -> Result<(), RaftError> {
        if !self.sequencers.contains_key(&rpc.session_id) {
            let _ = tx.send(Err(ClientWriteError::Session(SessionError::UnknownSession(rpc.session_id))));
            return Ok(());
        }
        let payload = EntryPayload::KeepAlive { session_id: rpc.session_id, command_sequence: rpc.command_sequence, event_sequence: rpc.event_sequence };
        let log_id = self.append_one(payload).await?;
        self.awaiting.insert(log_id.index, Awaiting::KeepAlive(tx));
        self.advance_commit_index().await?;
        self.reap_expired_sessions().await
    }

    async fn handle_unregister(&mut self, rpc: UnregisterRequest, tx: RespTx<(), ClientWriteError>) -> Result<(), RaftError> {
        if !self.sequencers.contains_key(&rpc.session_id) {
            let _ = tx.send(Err(ClientWriteError::Session(SessionError::UnknownSession(rpc.session_id))));
            return Ok(());
        }
        let payload = EntryPayload::Unregister { session_id: rpc.session_id, expired: false };
        let log_id = self.append_one(payload).await?;
        self.awaiting.insert(log_id.index, Awaiting::Unregister(tx));
        self.advance_commit_index().await?;
        self.reap_expired_sessions().await
    }

    /// SessionReaper (§4.5): issue `Unregister{expired: true}` for every
    /// session the state machine has marked `Unstable`, latching each one
    /// so a later pass does not issue a second expiry before the first
    /// commits. No caller is waiting on these, so nothing is recorded in
    /// `awaiting`. Run after every session-affecting RPC completes, and
    /// again on a fixed tick as a backstop so a session can still be
    /// reaped during a quiet period with no session traffic of its own.
    async fn reap_expired_sessions(&mut self) -> Result<(), RaftError> {
        if !self.core.target_role.is_leader() {
            return Ok(());
        }
        self.core
            .storage
            .poll_session_timeouts(crate::now_millis())
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let due = reaper::sessions_needing_expiry(self.core.storage.as_ref()).await;
        for session_id in due {
            self.core.storage.sessions().update(session_id, |s| s.unregistering = true).await;
            self.append_one(EntryPayload::Unregister { session_id, expired: true }).await?;
            self.advance_commit_index().await?;
            self.expired_total += 1;
        }
        if self.expired_total > 0 {
            self.report_leader_metrics().await;
        }
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////
    // Cluster reconfiguration (§4.3, §9 Open Question 1)

    async fn handle_join(&mut self, member: Member, tx: RespTx<(), ChangeConfigError>) -> Result<(), RaftError> {
        if self.config_coordinator.in_progress() || self.initializing() {
            let _ = tx.send(Err(ChangeConfigError::ConfigurationInProgress));
            return Ok(());
        }
        match config_coordinator::apply_join(&self.core.membership, member) {
            Ok(Some(next)) => self.propose_configuration(next, tx).await,
            Ok(None) => {
                let _ = tx.send(Ok(()));
                Ok(())
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                Ok(())
            }
        }
    }

    async fn handle_leave(&mut self, member_id: NodeId, tx: RespTx<(), ChangeConfigError>) -> Result<(), RaftError> {
        if self.config_coordinator.in_progress() || self.initializing() {
            let _ = tx.send(Err(ChangeConfigError::ConfigurationInProgress));
            return Ok(());
        }
        match config_coordinator::apply_leave(&self.core.membership, member_id) {
            Ok(Some(next)) => self.propose_configuration(next, tx).await,
            Ok(None) => {
                let _ = tx.send(Ok(()));
                Ok(())
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                Ok(())
            }
        }
    }

    async fn handle_reconfigure(&mut self, rpc: ReconfigureRequest, tx: RespTx<(), ChangeConfigError>) -> Result<(), RaftError> {
        if self.config_coordinator.in_progress() || self.initializing() {
            let _ = tx.send(Err(ChangeConfigError::ConfigurationInProgress));
            return Ok(());
        }
        let accepted = ConfigCoordinatorState::accepts_reconfigure(
            self.configuration_log_id.index,
            self.configuration_log_id.term,
            &self.core.membership,
            rpc.index,
            rpc.term,
            &rpc.members,
        );
        if !accepted {
            let _ = tx.send(Err(ChangeConfigError::IllegalConfiguration));
            return Ok(());
        }
        self.propose_configuration(rpc.members, tx).await
    }

    async fn propose_configuration(&mut self, next: Configuration, tx: RespTx<(), ChangeConfigError>) -> Result<(), RaftError> {
        let log_id = self.append_one(EntryPayload::Configuration(next)).await?;
        // Both of these must be in place before the commit index can possibly
        // move past log_id: a synchronously-quorate commit runs
        // deliver_response inline, which resets `configuring` back to 0 and
        // resolves `tx` by removing it from `awaiting`.
        self.config_coordinator.configuring = log_id.index;
        self.awaiting.insert(log_id.index, Awaiting::ConfigChange(tx));
        self.advance_commit_index().await?;
        Ok(())
    }
}
