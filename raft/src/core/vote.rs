//! Handling of `RequestVote` RPCs (§4.1).

use crate::core::Role;
use crate::core::RaftCore;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(crate) async fn handle_vote_request(&mut self, req: VoteRequest) -> Result<VoteResponse, RaftError> {
        use crate::MessageSummary;

        if req.term < self.current_term {
            return Ok(VoteResponse { term: self.current_term, vote_granted: false });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.set_target_role_if_not_shutdown(Role::Follower);
            self.save_hard_state().await?;
        }

        let already_voted_for_other =
            matches!(self.voted_for, Some(candidate) if candidate != req.candidate_id);
        let log_is_up_to_date = req.last_log_id >= self.last_log_id;

        if already_voted_for_other || !log_is_up_to_date {
            return Ok(VoteResponse { term: self.current_term, vote_granted: false });
        }

        self.voted_for = Some(req.candidate_id);
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.save_hard_state().await?;
        self.update_next_election_timeout(false);

        Ok(VoteResponse { term: self.current_term, vote_granted: true })
    }

    fn set_target_role_if_not_shutdown(&mut self, role: Role) {
        if self.target_role != Role::Shutdown {
            self.target_role = role;
        }
    }
}
