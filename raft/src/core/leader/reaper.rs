//! SessionReaper (§4.5): run after every session-affecting RPC completes.
//! For each session the state machine has marked `Unstable` and which is not
//! already `unregistering`, appends an `Unregister{expired: true}` entry and
//! sets the latch so the same session is never reaped twice concurrently.
//!
//! Only the current leader reaps sessions (§4.5) — this module is only ever
//! invoked from within `LeaderState`.

use crate::storage::SessionState;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftStorage;
use crate::SessionId;

/// Returns the ids of sessions that need an expiry entry appended. The
/// caller is responsible for setting each session's `unregistering` latch
/// (via the `Unregister{expired: true}` entry it appends) so a concurrent
/// pass never double-issues.
pub(crate) async fn sessions_needing_expiry<D, R, S>(storage: &S) -> Vec<SessionId>
where
    D: AppData,
    R: AppDataResponse,
    S: RaftStorage<D, R>,
{
    let mut due = Vec::new();
    for session in storage.sessions().all().await {
        if session.state == SessionState::Unstable && !session.unregistering {
            due.push(session.id);
        }
    }
    due
}
