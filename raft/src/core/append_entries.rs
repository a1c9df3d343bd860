//! Handling of `AppendEntries` RPCs (§4.1, §4.2): log consistency checking,
//! truncation of conflicting entries, and advancing the local commit index.
//!
//! The consistency check and conflict-index response are grounded in the
//! open-raft project's append-entries handler (see the `append_entries.rs`
//! file retrieved alongside the pack's other examples).

use crate::core::Role;
use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(crate) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> Result<AppendEntriesResponse, RaftError> {
        use crate::MessageSummary;

        if req.term < self.current_term {
            return Ok(AppendEntriesResponse { term: self.current_term, success: false, conflict_opt: None });
        }

        if req.term > self.current_term || self.target_role == Role::Candidate {
            self.update_current_term(req.term, None);
            self.target_role = Role::Follower;
            self.save_hard_state().await?;
        }

        self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        self.update_next_election_timeout(true);

        if req.prev_log_id.index != 0 {
            let consistent = if req.prev_log_id == self.last_log_id {
                true
            } else {
                let entries = self
                    .storage
                    .get_log_entries(req.prev_log_id.index..req.prev_log_id.index + 1)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                matches!(entries.first(), Some(e) if e.log_id == req.prev_log_id)
            };

            if !consistent {
                let conflict_opt = Some(ConflictOpt { log_id: self.last_matching_log_id_before(req.prev_log_id.index).await? });
                return Ok(AppendEntriesResponse { term: self.current_term, success: false, conflict_opt });
            }
        }

        if !req.entries.is_empty() {
            let first_new_index = req.entries[0].log_id.index;
            if first_new_index <= self.last_log_id.index {
                self.storage.delete_logs_from(first_new_index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            }
            self.storage.append_to_log(&req.entries).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = req.entries.last().expect("checked non-empty above").log_id;
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_log_id.index);
            self.replicate_to_state_machine_if_needed().await?;
        }

        Ok(AppendEntriesResponse { term: self.current_term, success: true, conflict_opt: None })
    }

    /// Walk backward from `before_index` to find the last locally held log
    /// id, for the conflicting-index replication backoff (§4.2).
    async fn last_matching_log_id_before(&mut self, before_index: u64) -> Result<LogId, RaftError> {
        if before_index == 0 || before_index > self.last_log_id.index {
            return Ok(self.last_log_id);
        }
        let start = before_index.saturating_sub(1);
        let entries =
            self.storage.get_log_entries(start..before_index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(entries.first().map(|e| e.log_id).unwrap_or_default())
    }

    /// Apply any newly committed entries to the state machine. Followers
    /// drive this from `leader_commit`; the leader drives it from its own
    /// computed commit index in `leader::LeaderState`.
    pub(crate) async fn replicate_to_state_machine_if_needed(&mut self) -> Result<(), RaftError> {
        if self.commit_index <= self.last_applied.index {
            return Ok(());
        }
        let start = self.last_applied.index + 1;
        let entries = self
            .storage
            .get_log_entries(start..self.commit_index + 1)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if entries.is_empty() {
            return Ok(());
        }
        let last_log_id = entries.last().expect("checked non-empty above").log_id;
        for entry in &entries {
            if let crate::storage::EntryPayload::Configuration(cfg) = &entry.payload {
                self.update_membership(cfg.clone());
            }
        }
        self.storage.apply_to_state_machine(&entries).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_applied = last_log_id;
        self.report_metrics(crate::Update::Ignore);
        Ok(())
    }
}
