//! An in-memory `raft::RaftStorage` implementation and the session-aware
//! key/value state machine it drives. This is the direct analogue of the
//! teacher's `memstore` crate: the log, hard state and applied state all
//! live behind `RwLock`s in a single process, with nothing persisted to
//! disk, so it is only ever suitable for tests.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use raft::storage::AppError;
use raft::storage::ApplyOutcome;
use raft::storage::Configuration;
use raft::storage::Entry;
use raft::storage::EntryPayload;
use raft::storage::HardState;
use raft::storage::InitialState;
use raft::storage::RaftStorage;
use raft::storage::RaftStorageDebug;
use raft::storage::Session;
use raft::storage::SessionState;
use raft::storage::SessionTable;
use raft::ClientId;
use raft::LogId;
use raft::LogIndex;
use raft::NodeId;
use raft::SessionId;
use raft::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// The command/query payload this store understands. Shared between
/// `Command` entries (only `Set`/`Delete` make sense there) and `query()`
/// requests (only `Get` makes sense there) the same way a real application's
/// request enum would be.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Set { key: String, value: String },
    Delete { key: String },
    Get { key: String },
    /// Set `key` to `value` only if its current value equals `expected`
    /// (`None` meaning absent). The one request in this state machine that
    /// can fail at apply time, exercising the scoped application-error path
    /// distinct from a storage/replication failure.
    CompareAndSwap { key: String, expected: Option<String>, value: String },
}

/// The response produced for a `Request`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Set { previous: Option<String> },
    Deleted { previous: Option<String> },
    Value(Option<String>),
    Swapped { previous: Option<String> },
}

/// Error returned when this store is asked to keep running after it has
/// been told to shut down. Exists only to satisfy `RaftStorage::ShutdownError`;
/// this in-memory store never actually produces one.
#[derive(Clone, Debug, Error)]
#[error("sessionstore is shutting down")]
pub struct ShutdownError;

/// The applied, durable part of the state machine: separated from the log
/// and hard state so a snapshot of it can be handed to tests via
/// `RaftStorageDebug`.
#[derive(Clone, Debug, Default)]
pub struct StateMachineData {
    pub last_applied_log: LogId,
    pub kv: BTreeMap<String, String>,
    next_session_id: SessionId,
}

/// An in-memory `RaftStorage<Request, Response>`.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<LogIndex, Entry<Request>>>,
    hard_state: RwLock<HardState>,
    state_machine: RwLock<StateMachineData>,
    sessions: SessionTable,
    /// Ids that have transitioned to `Expired`, in the order it happened.
    /// Not part of the `RaftStorage` contract; exposed so tests can assert
    /// an expiry listener "fired" exactly once per session (§4.5).
    expired: RwLock<Vec<SessionId>>,
}

impl MemStore {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            hard_state: RwLock::new(HardState::default()),
            state_machine: RwLock::new(StateMachineData::default()),
            sessions: SessionTable::default(),
            expired: RwLock::new(Vec::new()),
        }
    }

    pub fn new_with_configuration(id: NodeId, config: Configuration) -> Self {
        let store = Self::new(id);
        store
            .log
            .try_write()
            .expect("uncontended at construction")
            .insert(1, Entry { log_id: LogId { term: 0, index: 1 }, payload: EntryPayload::Configuration(config) });
        store
    }

    /// Ids that have transitioned to `Expired` so far, oldest first.
    pub async fn expired_sessions(&self) -> Vec<SessionId> {
        self.expired.read().await.clone()
    }
}

#[async_trait]
impl RaftStorage<Request, Response> for MemStore {
    type ShutdownError = ShutdownError;

    async fn get_membership_config(&self) -> anyhow::Result<Configuration> {
        let log = self.log.read().await;
        for entry in log.values().rev() {
            if let EntryPayload::Configuration(config) = &entry.payload {
                return Ok(config.clone());
            }
        }
        Ok(Configuration::new_initial(self.id))
    }

    async fn get_initial_state(&self) -> anyhow::Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let last_log_id = self.get_last_log_id().await?;
        let hard_state = self.hard_state.read().await.clone();
        let last_applied_log = self.state_machine.read().await.last_applied_log;
        Ok(InitialState { last_log_id, last_applied_log, hard_state, membership })
    }

    async fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        *self.hard_state.write().await = hs.clone();
        Ok(())
    }

    async fn get_log_entries(&self, range: Range<LogIndex>) -> anyhow::Result<Vec<Entry<Request>>> {
        Ok(self.log.read().await.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn get_last_log_id(&self) -> anyhow::Result<LogId> {
        Ok(self.log.read().await.values().last().map(|entry| entry.log_id).unwrap_or_default())
    }

    async fn delete_logs_from(&self, start: LogIndex) -> anyhow::Result<()> {
        self.log.write().await.split_off(&start);
        Ok(())
    }

    async fn append_to_log(&self, entries: &[Entry<Request>]) -> anyhow::Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[Entry<Request>]) -> anyhow::Result<Vec<ApplyOutcome<Response>>> {
        let mut sm = self.state_machine.write().await;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            sm.last_applied_log = entry.log_id;
            let outcome = match &entry.payload {
                EntryPayload::Initialize | EntryPayload::Configuration(_) => ApplyOutcome::Ack,

                EntryPayload::Command { session_id, sequence, data, client_id: _ } => {
                    let response = apply_request(&mut sm.kv, data);
                    self.sessions
                        .update(*session_id, |s| {
                            s.last_command_sequence = *sequence;
                            s.last_updated = raft::now_millis();
                        })
                        .await;
                    ApplyOutcome::Command(response)
                }

                EntryPayload::Connect { client_id, address } => {
                    if let Some(session_id) = self.sessions.lookup_by_client(*client_id).await {
                        self.sessions
                            .update(session_id, |s| {
                                s.address = Some(address.clone());
                                s.last_updated = raft::now_millis();
                            })
                            .await;
                    }
                    ApplyOutcome::Ack
                }

                EntryPayload::Register { client_id, timeout_millis } => {
                    sm.next_session_id += 1;
                    let session_id = sm.next_session_id;
                    self.sessions
                        .insert(Session {
                            id: session_id,
                            client_id: *client_id,
                            state: SessionState::Stable,
                            timeout_millis: *timeout_millis,
                            last_updated: raft::now_millis(),
                            last_command_sequence: 0,
                            last_event_sequence: 0,
                            address: None,
                            unregistering: false,
                        })
                        .await;
                    ApplyOutcome::Registered(session_id)
                }

                EntryPayload::KeepAlive { session_id, command_sequence, event_sequence } => {
                    self.sessions
                        .update(*session_id, |s| {
                            s.last_command_sequence = (*command_sequence).max(s.last_command_sequence);
                            s.last_event_sequence = (*event_sequence).max(s.last_event_sequence);
                            s.last_updated = raft::now_millis();
                            if s.state == SessionState::Unstable {
                                s.state = SessionState::Stable;
                            }
                        })
                        .await;
                    ApplyOutcome::Ack
                }

                EntryPayload::Unregister { session_id, expired } => {
                    if *expired {
                        self.sessions.update(*session_id, |s| s.state = SessionState::Expired).await;
                        self.expired.write().await.push(*session_id);
                    }
                    self.sessions.remove(*session_id).await;
                    ApplyOutcome::Ack
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn query_state_machine(&self, _session_id: SessionId, data: &Request) -> anyhow::Result<Response> {
        let sm = self.state_machine.read().await;
        Ok(match data {
            Request::Get { key } => Response::Value(sm.kv.get(key).cloned()),
            Request::Set { .. } | Request::Delete { .. } | Request::CompareAndSwap { .. } => Response::Value(None),
        })
    }

    fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    async fn poll_session_timeouts(&self, now: Timestamp) -> anyhow::Result<()> {
        for session in self.sessions.all().await {
            if session.state != SessionState::Stable {
                continue;
            }
            if now.saturating_sub(session.last_updated) > session.timeout_millis {
                self.sessions.update(session.id, |s| s.state = SessionState::Unstable).await;
            }
        }
        Ok(())
    }
}

/// Apply one command to the key/value map, producing the response the
/// caller (or a later replay from the sequencer's cache) sees. The only
/// request that can fail is `CompareAndSwap`, whose mismatch is an
/// application-level outcome, not a storage failure.
fn apply_request(kv: &mut BTreeMap<String, String>, request: &Request) -> Result<Response, AppError> {
    match request {
        Request::Set { key, value } => Ok(Response::Set { previous: kv.insert(key.clone(), value.clone()) }),
        Request::Delete { key } => Ok(Response::Deleted { previous: kv.remove(key) }),
        Request::Get { key } => Ok(Response::Value(kv.get(key).cloned())),
        Request::CompareAndSwap { key, expected, value } => {
            let current = kv.get(key).cloned();
            if current != *expected {
                return Err(AppError {
                    kind: "compare_mismatch".into(),
                    message: format!("key {key:?} was {current:?}, expected {expected:?}"),
                });
            }
            Ok(Response::Swapped { previous: kv.insert(key.clone(), value.clone()) })
        }
    }
}

#[async_trait]
impl RaftStorageDebug<StateMachineData> for MemStore {
    async fn get_state_machine(&self) -> StateMachineData {
        self.state_machine.read().await.clone()
    }

    async fn read_hard_state(&self) -> Option<HardState> {
        Some(self.hard_state.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::ClientId;
    use raft::LogId;

    fn entry(index: LogIndex, payload: EntryPayload<Request>) -> Entry<Request> {
        Entry { log_id: LogId { term: 1, index }, payload }
    }

    #[tokio::test]
    async fn register_then_command_then_query_round_trips() {
        let store = MemStore::new(1);
        let client_id: ClientId = 42;

        let outcomes = store
            .apply_to_state_machine(&[entry(1, EntryPayload::Register { client_id, timeout_millis: 10_000 })])
            .await
            .unwrap();
        let session_id = match outcomes[0] {
            ApplyOutcome::Registered(id) => id,
            _ => panic!("expected Registered"),
        };

        let outcomes = store
            .apply_to_state_machine(&[entry(
                2,
                EntryPayload::Command { client_id, session_id, sequence: 1, data: Request::Set { key: "k".into(), value: "v".into() } },
            )])
            .await
            .unwrap();
        assert!(matches!(outcomes[0], ApplyOutcome::Command(Ok(Response::Set { previous: None }))));

        let response = store.query_state_machine(session_id, &Request::Get { key: "k".into() }).await.unwrap();
        assert_eq!(response, Response::Value(Some("v".into())));
    }

    #[tokio::test]
    async fn compare_and_swap_mismatch_surfaces_as_application_error() {
        let store = MemStore::new(1);
        let client_id: ClientId = 11;
        let outcomes = store
            .apply_to_state_machine(&[entry(1, EntryPayload::Register { client_id, timeout_millis: 10_000 })])
            .await
            .unwrap();
        let session_id = match outcomes[0] {
            ApplyOutcome::Registered(id) => id,
            _ => panic!("expected Registered"),
        };

        let outcomes = store
            .apply_to_state_machine(&[entry(
                2,
                EntryPayload::Command {
                    client_id,
                    session_id,
                    sequence: 1,
                    data: Request::CompareAndSwap { key: "k".into(), expected: Some("old".into()), value: "new".into() },
                },
            )])
            .await
            .unwrap();

        match &outcomes[0] {
            ApplyOutcome::Command(Err(err)) => assert_eq!(err.kind, "compare_mismatch"),
            other => panic!("expected a scoped application error, got {other:?}"),
        }

        assert_eq!(store.get_state_machine().await.kv.get("k"), None);
    }

    #[tokio::test]
    async fn connect_binds_address_for_known_client_and_is_a_no_op_for_unknown_client() {
        let store = MemStore::new(1);
        let client_id: ClientId = 21;
        let outcomes = store
            .apply_to_state_machine(&[entry(1, EntryPayload::Register { client_id, timeout_millis: 10_000 })])
            .await
            .unwrap();
        let session_id = match outcomes[0] {
            ApplyOutcome::Registered(id) => id,
            _ => panic!("expected Registered"),
        };

        // Unrecognized client id: the entry still applies without error.
        store
            .apply_to_state_machine(&[entry(2, EntryPayload::Connect { client_id: 9999, address: "10.0.0.1:9".into() })])
            .await
            .unwrap();
        assert_eq!(store.sessions().get(session_id).await.unwrap().address, None);

        store
            .apply_to_state_machine(&[entry(3, EntryPayload::Connect { client_id, address: "10.0.0.2:9000".into() })])
            .await
            .unwrap();
        assert_eq!(store.sessions().get(session_id).await.unwrap().address, Some("10.0.0.2:9000".into()));
    }

    #[tokio::test]
    async fn unregister_expired_marks_session_and_records_listener() {
        let store = MemStore::new(1);
        let client_id: ClientId = 7;
        let outcomes = store
            .apply_to_state_machine(&[entry(1, EntryPayload::Register { client_id, timeout_millis: 10_000 })])
            .await
            .unwrap();
        let session_id = match outcomes[0] {
            ApplyOutcome::Registered(id) => id,
            _ => panic!("expected Registered"),
        };

        store.apply_to_state_machine(&[entry(2, EntryPayload::Unregister { session_id, expired: true })]).await.unwrap();

        assert!(store.sessions().get(session_id).await.is_none());
        assert_eq!(store.expired_sessions().await, vec![session_id]);
    }

    #[tokio::test]
    async fn poll_session_timeouts_marks_stale_sessions_unstable() {
        let store = MemStore::new(1);
        let client_id: ClientId = 9;
        let outcomes = store
            .apply_to_state_machine(&[entry(1, EntryPayload::Register { client_id, timeout_millis: 100 })])
            .await
            .unwrap();
        let session_id = match outcomes[0] {
            ApplyOutcome::Registered(id) => id,
            _ => panic!("expected Registered"),
        };

        store.sessions().update(session_id, |s| s.last_updated = 0).await;
        store.poll_session_timeouts(10_000).await.unwrap();

        let session = store.sessions().get(session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Unstable);
    }

    #[tokio::test]
    async fn get_log_entries_returns_contiguous_range() {
        let store = MemStore::new(1);
        store
            .append_to_log(&[entry(1, EntryPayload::Initialize), entry(2, EntryPayload::Initialize), entry(3, EntryPayload::Initialize)])
            .await
            .unwrap();

        let entries = store.get_log_entries(1..3).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_id.index, 1);
        assert_eq!(entries[1].log_id.index, 2);
    }

    #[tokio::test]
    async fn delete_logs_from_truncates_conflicting_suffix() {
        let store = MemStore::new(1);
        store
            .append_to_log(&[entry(1, EntryPayload::Initialize), entry(2, EntryPayload::Initialize), entry(3, EntryPayload::Initialize)])
            .await
            .unwrap();

        store.delete_logs_from(2).await.unwrap();

        assert_eq!(store.get_last_log_id().await.unwrap().index, 1);
    }
}
