//! The core driver of a Raft node: the single task that owns all mutable
//! node state and dispatches to whichever role (`Leader`, `Follower`,
//! `Candidate`, `NonVoter`) is currently active.
//!
//! Follower, Candidate, and NonVoter are implemented only to the depth
//! needed to drive this crate's own tests and to give a leader somewhere to
//! step down to. The substantial logic lives in [`leader`].

mod append_entries;
pub mod leader;
mod vote;

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::metrics::RaftMetrics;
use crate::metrics::RoleMetric;
use crate::raft::RaftMsg;
use crate::storage::Configuration;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

pub use leader::LeaderState;

/// All possible roles of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Receiving entries but neither voting nor timing out; used for a
    /// member still catching up before it is promoted to voter.
    NonVoter,
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl Role {
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The core type implementing the Raft protocol and driving role
/// transitions.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) membership: Configuration,
    pub(crate) network: Arc<N>,
    pub(crate) storage: Arc<S>,

    pub(crate) target_role: Role,

    /// Highest log index known to be replicated to a majority of the
    /// cluster.
    pub(crate) commit_index: u64,
    /// Highest log id applied to the local state machine.
    pub(crate) last_applied: LogId,
    pub(crate) current_term: u64,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) last_log_id: LogId,

    pub(crate) last_heartbeat: Option<Instant>,
    pub(crate) next_election_timeout: Option<Instant>,

    pub(crate) rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    pub(crate) tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<anyhow::Result<()>> {
        let membership = Configuration::new_initial(id);
        let this = Self {
            id,
            config,
            membership,
            network,
            storage,
            target_role: Role::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> anyhow::Result<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied_log;
        self.commit_index = 0;

        let has_log = self.last_log_id.index != 0;
        let single = self.membership.members.len() == 1;
        let is_voter = self.membership.contains(self.id);

        self.target_role = match (has_log, single, is_voter) {
            (true, true, true) => Role::Leader,
            (_, _, false) => Role::NonVoter,
            (false, true, true) => Role::NonVoter,
            (true, false, true) => Role::Follower,
            (false, false, true) => Role::Follower,
        };

        if self.target_role == Role::Follower {
            let inst =
                Instant::now() + Duration::from_secs(2) + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!(id = self.id, target_role = ?self.target_role, "startup role computed");

        loop {
            match &self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => self.run_candidate().await?,
                Role::Follower => self.run_follower().await?,
                Role::NonVoter => self.run_non_voter().await?,
                Role::Shutdown => {
                    tracing::info!(id = self.id, "node has shut down");
                    return Ok(());
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, leader_metrics))]
    pub(crate) fn report_metrics(&mut self, leader_metrics: Update<Option<&crate::metrics::LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: RoleMetric::from(&self.target_role),
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error = %err, id = self.id, "error reporting metrics");
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> Result<(), RaftError> {
        let hs = HardState { current_term: self.current_term, voted_for: self.voted_for };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_role(&mut self, target_role: Role) {
        if target_role == Role::Follower && !self.membership.contains(self.id) {
            self.target_role = Role::NonVoter;
        } else {
            self.target_role = target_role;
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = ?err, id = self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        RaftError::RaftStorage(err)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_membership(&mut self, cfg: Configuration) {
        self.membership = cfg;
        if !self.membership.contains(self.id) {
            self.set_target_role(Role::NonVoter);
        } else if self.target_role == Role::NonVoter {
            self.set_target_role(Role::Follower);
        }
    }

    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    fn reject_config_change_not_leader<T>(&self, tx: oneshot::Sender<Result<T, ChangeConfigError>>) {
        let _ = tx.send(Err(ChangeConfigError::ForwardToLeader(self.current_leader)));
    }

    fn reject_write_not_leader(&self, tx: oneshot::Sender<Result<crate::raft::CommandResponse<R>, ClientWriteError>>) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
    }

    fn reject_read_not_leader(&self, tx: oneshot::Sender<Result<crate::raft::CommandResponse<R>, ClientReadError>>) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.current_leader)));
    }
}

#[derive(Debug)]
enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Handle one inbound `RaftMsg` while not in Leader state: RPCs are
    /// answered directly, everything else is either rejected (config
    /// changes) or forwarded (client reads/writes) to the known leader.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_non_leader_msg(&mut self, msg: RaftMsg<D, R>) {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            RaftMsg::Poll { rpc, tx } => {
                let _ = tx.send(Ok(crate::raft::PollResponse { term: self.current_term, accepted: false }));
                let _ = rpc;
            }
            RaftMsg::Command { tx, .. } => self.reject_write_not_leader(tx),
            RaftMsg::Query { tx, .. } => self.reject_read_not_leader(tx),
            RaftMsg::Register { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Connect { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::KeepAlive { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Unregister { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
            }
            RaftMsg::Initialize { tx, .. } => self.reject_init_with_config(tx),
            RaftMsg::Join { tx, .. } => self.reject_config_change_not_leader(tx),
            RaftMsg::Leave { tx, .. } => self.reject_config_change_not_leader(tx),
            RaftMsg::Reconfigure { tx, .. } => self.reject_config_change_not_leader(tx),
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, role = "follower"))]
    async fn run_follower(&mut self) -> Result<(), RaftError> {
        self.report_metrics(Update::Update(None));
        loop {
            if !self.target_role.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => self.set_target_role(Role::Candidate),
                Some((msg, span)) = self.rx_api.recv() => {
                    let _ent = span.enter();
                    self.handle_non_leader_msg(msg).await;
                }
                Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, role = "non_voter"))]
    async fn run_non_voter(&mut self) -> Result<(), RaftError> {
        self.report_metrics(Update::Update(None));
        loop {
            if !self.target_role.is_non_voter() {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Initialize { members, tx } => {
                            let res = if self.last_log_id.index == 0 {
                                self.membership = members;
                                self.current_term = 1;
                                self.voted_for = Some(self.id);
                                let _ = self.save_hard_state().await;
                                self.set_target_role(Role::Leader);
                                Ok(())
                            } else {
                                Err(InitializeError::NotAllowed)
                            };
                            let _ = tx.send(res);
                        }
                        other => self.handle_non_leader_msg(other).await,
                    }
                }
                Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, role = "candidate"))]
    async fn run_candidate(&mut self) -> Result<(), RaftError> {
        loop {
            if !self.target_role.is_candidate() {
                return Ok(());
            }

            self.update_next_election_timeout(false);
            self.current_term += 1;
            self.voted_for = Some(self.id);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_hard_state().await?;
            self.report_metrics(Update::Update(None));

            let mut votes_granted = 1usize;
            let votes_needed = crate::quorum::majority_of(self.membership.voters().len());
            let targets: Vec<NodeId> = self.membership.voters().into_iter().filter(|id| *id != self.id).collect();

            let (tx_vote, mut rx_vote) = mpsc::unbounded_channel();
            for target in targets {
                let network = self.network.clone();
                let rpc = crate::raft::VoteRequest { term: self.current_term, candidate_id: self.id, last_log_id: self.last_log_id };
                let tx_vote = tx_vote.clone();
                tokio::spawn(async move {
                    let res = network.send_vote(target, rpc).await;
                    let _ = tx_vote.send((target, res));
                });
            }
            drop(tx_vote);

            loop {
                if !self.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.get_next_election_timeout());

                tokio::select! {
                    _ = timeout_fut => break,
                    Some((_target, res)) = rx_vote.recv() => {
                        if let Ok(resp) = res {
                            if resp.term > self.current_term {
                                self.update_current_term(resp.term, None);
                                self.set_target_role(Role::Follower);
                                continue;
                            }
                            if resp.vote_granted {
                                votes_granted += 1;
                                if votes_granted >= votes_needed {
                                    self.set_target_role(Role::Leader);
                                }
                            }
                        }
                    }
                    Some((msg, span)) = self.rx_api.recv() => {
                        let _ent = span.enter();
                        self.handle_non_leader_msg(msg).await;
                    }
                    Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
                }
            }
        }
    }
}
