//! Runtime configuration for a Raft node.
//!
//! Follows the teacher's builder-validated `Config` shape. Snapshotting is
//! deliberately not configurable here: log compaction and snapshot transfer
//! are named out of scope in §1 of the spec.

use rand::Rng;

/// Runtime config for a Raft node.
#[derive(Clone, Debug)]
pub struct Config {
    /// A name for the cluster, primarily used in logging.
    pub cluster_name: String,

    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,

    /// The interval, in milliseconds, at which leaders send heartbeats
    /// (empty `AppendEntries` RPCs) to followers. Also used as the
    /// per-RPC timeout for replication traffic.
    pub heartbeat_interval: u64,

    /// The maximum number of entries to send in a single `AppendEntries`
    /// RPC.
    pub max_payload_entries: u64,

    /// How long, in milliseconds, a follower may go without a successful
    /// `AppendEntries` round-trip before its replication metrics report it
    /// as lagging.
    pub replication_lag_threshold: u64,

    /// Whether the leader's fixed-tick reaper backstop runs at all. A
    /// session-affecting RPC always re-checks for expired sessions as a
    /// side effect regardless of this setting; this only controls the
    /// periodic sweep that catches a session left with no traffic of its
    /// own (§4.5).
    pub session_reap_check: bool,

    /// The session timeout assigned to a session when the client's
    /// `register` request does not specify one.
    pub default_session_timeout_millis: u64,

    /// Minimum session timeout a client may request.
    pub min_session_timeout_millis: u64,
    /// Maximum session timeout a client may request.
    pub max_session_timeout_millis: u64,
}

impl Config {
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            session_reap_check: None,
            default_session_timeout_millis: None,
            min_session_timeout_millis: None,
            max_session_timeout_millis: None,
        }
    }

    /// Generate a new random election timeout within the configured bounds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min, self.election_timeout_max)
    }

    /// Clamp a client-requested session timeout into the configured bounds,
    /// falling back to the default when unspecified.
    pub fn session_timeout_millis(&self, requested: Option<u64>) -> u64 {
        match requested {
            None | Some(0) => self.default_session_timeout_millis,
            Some(t) => t.clamp(self.min_session_timeout_millis, self.max_session_timeout_millis),
        }
    }
}

pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    session_reap_check: Option<bool>,
    default_session_timeout_millis: Option<u64>,
    min_session_timeout_millis: Option<u64>,
    max_session_timeout_millis: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min must be less than election_timeout_max")]
    InvalidElectionTimeout,
    #[error("heartbeat_interval must be less than election_timeout_min")]
    HeartbeatExceedsElectionTimeout,
    #[error("replication_lag_threshold must be greater than heartbeat_interval")]
    ReplicationLagThresholdTooLow,
    #[error("min_session_timeout_millis must be less than max_session_timeout_millis")]
    InvalidSessionTimeoutBounds,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = Some(v);
        self
    }
    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = Some(v);
        self
    }
    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = Some(v);
        self
    }
    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = Some(v);
        self
    }
    pub fn replication_lag_threshold(mut self, v: u64) -> Self {
        self.replication_lag_threshold = Some(v);
        self
    }
    pub fn session_reap_check(mut self, v: bool) -> Self {
        self.session_reap_check = Some(v);
        self
    }
    pub fn default_session_timeout_millis(mut self, v: u64) -> Self {
        self.default_session_timeout_millis = Some(v);
        self
    }
    pub fn min_session_timeout_millis(mut self, v: u64) -> Self {
        self.min_session_timeout_millis = Some(v);
        self
    }
    pub fn max_session_timeout_millis(mut self, v: u64) -> Self {
        self.max_session_timeout_millis = Some(v);
        self
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(150);
        let election_timeout_max = self.election_timeout_max.unwrap_or(300);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(50);
        let max_payload_entries = self.max_payload_entries.unwrap_or(300);
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(heartbeat_interval * 10);
        let session_reap_check = self.session_reap_check.unwrap_or(true);
        let default_session_timeout_millis = self.default_session_timeout_millis.unwrap_or(5_000);
        let min_session_timeout_millis = self.min_session_timeout_millis.unwrap_or(2_500);
        let max_session_timeout_millis = self.max_session_timeout_millis.unwrap_or(60_000);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::HeartbeatExceedsElectionTimeout);
        }
        if replication_lag_threshold <= heartbeat_interval {
            return Err(ConfigError::ReplicationLagThresholdTooLow);
        }
        if min_session_timeout_millis >= max_session_timeout_millis {
            return Err(ConfigError::InvalidSessionTimeoutBounds);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            session_reap_check,
            default_session_timeout_millis,
            min_session_timeout_millis,
            max_session_timeout_millis,
        })
    }
}
