//! SessionSequencer (§4.4): enforces per-session command and query ordering
//! without blocking the leader's single select loop.
//!
//! A command whose sequence number arrives out of order is stored rather
//! than applied; it is replayed once the gap closes. This is the message-
//! passing translation of the source's `() => applyCommand(...)` thunks
//! called for in §9: each pending entry is the original request plus its
//! response channel, drained in ascending sequence order from the leader's
//! own select loop.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::QueryRequest;
use crate::storage::AppError;
use crate::AppData;
use crate::AppDataResponse;
use crate::Sequence;

pub(crate) type CommandTx<R> = oneshot::Sender<Result<CommandResponse<R>, ClientWriteError>>;
pub(crate) type QueryTx<R> = oneshot::Sender<Result<CommandResponse<R>, ClientReadError>>;

pub(crate) struct PendingCommand<D: AppData, R: AppDataResponse> {
    pub req: CommandRequest<D>,
    pub tx: CommandTx<R>,
}

pub(crate) struct PendingQuery<D: AppData, R: AppDataResponse> {
    pub req: QueryRequest<D>,
    pub tx: QueryTx<R>,
}

/// Per-session ordering state.
pub(crate) struct SequencerState<D: AppData, R: AppDataResponse> {
    /// Highest sequence number the leader has accepted into log order
    /// (`requestSequence` in §3/§4.4).
    pub request_sequence: Sequence,
    /// Highest sequence number whose command has been applied
    /// (`commandSequence`).
    pub command_sequence: Sequence,
    pub pending_requests: BTreeMap<Sequence, PendingCommand<D, R>>,
    pub pending_queries: BTreeMap<Sequence, Vec<PendingQuery<D, R>>>,
    /// The response to every command this session has had applied, keyed by
    /// sequence (§4.4/§8): a client retrying any in-flight request — not
    /// just the most recent one, since several may be pipelined ahead of a
    /// slow acknowledgment — gets back the exact same answer instead of the
    /// command being applied a second time. Entries are pruned up to the
    /// `commandSequence` a client's own `KeepAlive` reports it has already
    /// observed, since it will never retry below that point.
    pub responses: BTreeMap<Sequence, Result<CommandResponse<R>, AppError>>,
}

impl<D: AppData, R: AppDataResponse> SequencerState<D, R> {
    pub fn new(request_sequence: Sequence, command_sequence: Sequence) -> Self {
        Self {
            request_sequence,
            command_sequence,
            pending_requests: BTreeMap::new(),
            pending_queries: BTreeMap::new(),
            responses: BTreeMap::new(),
        }
    }

    /// The cached response for `sequence`, if this session has already had a
    /// command applied at that exact sequence.
    pub fn cached_response(&self, sequence: Sequence) -> Option<Result<CommandResponse<R>, AppError>> {
        self.responses.get(&sequence).cloned()
    }

    pub fn record_response(&mut self, sequence: Sequence, resp: Result<CommandResponse<R>, AppError>) {
        self.command_sequence = self.command_sequence.max(sequence);
        self.responses.insert(sequence, resp);
    }

    /// Drop every cached response at or below `floor`: the client's own
    /// `KeepAlive.commandSequence` report means it has already observed
    /// these and will never retry them.
    pub fn prune_responses_below(&mut self, floor: Sequence) {
        self.responses = self.responses.split_off(&(floor + 1));
    }

    /// True if `sequence` must wait because it arrived ahead of the
    /// session's contiguous request order.
    pub fn must_enqueue_request(&self, sequence: Sequence) -> bool {
        sequence > self.request_sequence + 1
    }

    /// Pop every request immediately following `request_sequence`, in
    /// order, for the caller to run. Advances `request_sequence` as it
    /// pops so that consecutively-ready entries are all drained in a
    /// single call.
    pub fn drain_ready_requests(&mut self) -> Vec<PendingCommand<D, R>> {
        let mut ready = Vec::new();
        loop {
            let next = self.request_sequence + 1;
            match self.pending_requests.remove(&next) {
                Some(pending) => {
                    self.request_sequence = next;
                    ready.push(pending);
                }
                None => break,
            }
        }
        ready
    }

    pub fn must_enqueue_query(&self, sequence: Sequence) -> bool {
        sequence > self.command_sequence
    }

    pub fn enqueue_query(&mut self, sequence: Sequence, pending: PendingQuery<D, R>) {
        self.pending_queries.entry(sequence).or_insert_with(Vec::new).push(pending);
    }

    /// Drain and return every pending query gated on a sequence `<= s`, to
    /// run in order, once `command_sequence` has advanced to `s`.
    pub fn drain_ready_queries(&mut self, s: Sequence) -> Vec<PendingQuery<D, R>> {
        let mut ready = Vec::new();
        let keys: Vec<Sequence> = self.pending_queries.range(..=s).map(|(k, _)| *k).collect();
        for k in keys {
            if let Some(mut v) = self.pending_queries.remove(&k) {
                ready.append(&mut v);
            }
        }
        ready
    }
}
