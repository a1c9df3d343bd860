//! ConfigCoordinator (§4.3): serializes joins, leaves, and reconfigures
//! behind a one-at-a-time latch, and behind the leader's own `initializing`
//! gate.

use crate::error::ChangeConfigError;
use crate::storage::Configuration;
use crate::storage::Member;
use crate::storage::MemberRole;
use crate::LogIndex;
use crate::Term;

/// `configuring` names the index of an uncommitted `Configuration` entry, or
/// `0` if none is outstanding.
#[derive(Default)]
pub(crate) struct ConfigCoordinatorState {
    pub configuring: LogIndex,
}

impl ConfigCoordinatorState {
    pub fn in_progress(&self) -> bool {
        self.configuring != 0
    }

    /// Resolves §9 Open Question 1: a reconfigure is legal if
    /// `(index == 0 || index == current.index)` *and*
    /// `(term == current.term || only a member's role/status changed)` —
    /// the index and term checks are independent, so a caller whose view of
    /// the configuration's identity is stale by term alone can still land a
    /// role-only change, as long as it names the right index and touches no
    /// member's presence in the set.
    pub fn accepts_reconfigure(
        current_index: LogIndex,
        current_term: Term,
        current: &Configuration,
        req_index: LogIndex,
        req_term: Term,
        proposed: &Configuration,
    ) -> bool {
        let index_matches = req_index == 0 || req_index == current_index;
        if !index_matches {
            return false;
        }

        let role_only_change = current.is_role_only_change(proposed);
        if req_term != current_term && !role_only_change {
            return false;
        }

        current.is_single_step_from(proposed) || role_only_change
    }
}

/// `join`: idempotent if the member is already known; otherwise the new
/// member is added as `Promotable` so it catches up before becoming a
/// voter.
pub(crate) fn apply_join(current: &Configuration, member: Member) -> Result<Option<Configuration>, ChangeConfigError> {
    if current.members.contains_key(&member.id) {
        return Ok(None);
    }
    let mut next = current.clone();
    next.members.insert(member.id, MemberRole::Promotable);
    Ok(Some(next))
}

/// `leave`: idempotent if the member is unknown.
pub(crate) fn apply_leave(current: &Configuration, member_id: crate::MemberId) -> Result<Option<Configuration>, ChangeConfigError> {
    if !current.members.contains_key(&member_id) {
        return Ok(None);
    }
    if current.voters().len() == 1 && current.members.get(&member_id) == Some(&MemberRole::Voter) {
        return Err(ChangeConfigError::LastVoterRemoval);
    }
    let mut next = current.clone();
    next.members.remove(&member_id);
    Ok(Some(next))
}
