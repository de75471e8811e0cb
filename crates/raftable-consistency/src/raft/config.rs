// Raft configuration
// Provides configuration settings for the replicated database and its consensus engine

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::de::DeserializeOwned;

/// Environment variable prefix, e.g. `RAFTABLE_DATA_DIR`
pub const ENV_PREFIX: &str = "RAFTABLE";

/// Configuration for the replicated database node
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Election timeout in milliseconds (default: 5000ms)
    /// If a follower doesn't hear from the leader within this time, it starts an election
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 500ms)
    pub heartbeat_interval_ms: u64,

    /// Consensus RPC timeout in milliseconds (default: 2000ms)
    pub rpc_request_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Number of applied entries after which a snapshot is taken (default: 10000)
    pub snapshot_threshold: u64,

    /// Root directory for logs and snapshots (default: ./data)
    pub data_dir: PathBuf,

    /// Persistent log size that triggers a snapshot (default: 128MB)
    pub max_log_size_bytes: u64,

    /// How often the log size is checked in milliseconds (default: 10000ms)
    pub log_size_check_interval_ms: u64,

    /// Whether snapshots are zstd compressed (default: true)
    pub compress_snapshots: bool,

    /// Directory holding the membership definition file (default: ./config)
    pub config_dir: PathBuf,

    /// Membership definition file name (default: tablets.json)
    pub member_file: String,

    /// Tablet whose members replicate the database (default: "default")
    pub tablet_name: String,

    /// Upper bound on waiting for a quorum of members at startup (default: 120s)
    pub quorum_wait_secs: u64,

    /// Delay before a leader first advertises itself (default: 5000ms)
    pub leader_advertise_delay_ms: u64,

    /// Period of leader advertisements (default: 2000ms)
    pub leader_advertise_interval_ms: u64,

    /// Readiness probe attempts after startup (default: 100)
    pub activate_max_retries: u32,

    /// Delay between readiness probe attempts (default: 500ms)
    pub activate_retry_ms: u64,

    /// Poll interval while waiting for a leader to be known (default: 10ms)
    pub leader_poll_interval_ms: u64,

    /// Concurrent inbound consensus RPCs (default: 16)
    pub dispatch_workers: usize,

    /// Concurrent outbound requests per peer (default: 8)
    pub client_pool_size: usize,

    /// TTL mirror maintenance period in milliseconds (default: 25ms)
    pub ttl_housekeeping_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            heartbeat_interval_ms: 500,
            rpc_request_timeout_ms: 2000,
            max_payload_entries: 300,
            snapshot_threshold: 10000,
            data_dir: PathBuf::from("./data"),
            max_log_size_bytes: 128 * 1024 * 1024, // 128MB
            log_size_check_interval_ms: 10_000,
            compress_snapshots: true,
            config_dir: PathBuf::from("./config"),
            member_file: "tablets.json".to_string(),
            tablet_name: "default".to_string(),
            quorum_wait_secs: 120,
            leader_advertise_delay_ms: 5000,
            leader_advertise_interval_ms: 2000,
            activate_max_retries: 100,
            activate_retry_ms: 500,
            leader_poll_interval_ms: 10,
            dispatch_workers: 16,
            client_pool_size: 8,
            ttl_housekeeping_ms: 25,
        }
    }
}

fn override_with<T: DeserializeOwned>(
    source: &Config,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    match source.get::<T>(key) {
        Ok(value) => {
            *target = value;
            Ok(())
        }
        Err(ConfigError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

impl RaftConfig {
    /// Load from `RAFTABLE_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    pub fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        let source = Config::builder()
            .add_source(environment.try_parsing(true))
            .build()?;
        Self::from_source(&source)
    }

    /// Apply every key present in `source` on top of the defaults
    pub fn from_source(source: &Config) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        override_with(source, "data_dir", &mut config.data_dir)?;
        override_with(source, "max_log_size", &mut config.max_log_size_bytes)?;
        override_with(source, "election_timeout_ms", &mut config.election_timeout_ms)?;
        override_with(source, "heartbeat_interval_ms", &mut config.heartbeat_interval_ms)?;
        override_with(source, "rpc_timeout_ms", &mut config.rpc_request_timeout_ms)?;
        override_with(source, "snapshot_threshold", &mut config.snapshot_threshold)?;
        override_with(source, "compress_snapshots", &mut config.compress_snapshots)?;
        override_with(source, "config_dir", &mut config.config_dir)?;
        override_with(source, "member_file", &mut config.member_file)?;
        override_with(source, "tablet_name", &mut config.tablet_name)?;
        override_with(source, "quorum_wait_secs", &mut config.quorum_wait_secs)?;
        Ok(config)
    }

    /// Get election timeout as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_request_timeout_ms)
    }

    pub fn quorum_wait(&self) -> Duration {
        Duration::from_secs(self.quorum_wait_secs)
    }

    pub fn leader_advertise_delay(&self) -> Duration {
        Duration::from_millis(self.leader_advertise_delay_ms)
    }

    pub fn leader_advertise_interval(&self) -> Duration {
        Duration::from_millis(self.leader_advertise_interval_ms)
    }

    pub fn activate_retry(&self) -> Duration {
        Duration::from_millis(self.activate_retry_ms)
    }

    pub fn leader_poll_interval(&self) -> Duration {
        Duration::from_millis(self.leader_poll_interval_ms)
    }

    pub fn log_size_check_interval(&self) -> Duration {
        Duration::from_millis(self.log_size_check_interval_ms)
    }

    pub fn ttl_housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_housekeeping_ms)
    }

    /// Get the persistent log directory of a node
    pub fn log_dir(&self, node_id: &str) -> PathBuf {
        self.data_dir
            .join("raft")
            .join(format!("raftable-log_{}", node_id))
    }

    /// Get the snapshot directory of a node
    pub fn snapshot_dir(&self, node_id: &str) -> PathBuf {
        self.data_dir
            .join("raft")
            .join(format!("raftable-snapshot_{}", node_id))
    }

    /// Get the membership definition file path
    pub fn member_file_path(&self) -> PathBuf {
        self.config_dir.join(&self.member_file)
    }

    /// Ensure all data directories of a node exist
    pub fn ensure_dirs(&self, node_id: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.log_dir(node_id))?;
        std::fs::create_dir_all(self.snapshot_dir(node_id))?;
        Ok(())
    }

    /// Convert to a validated openraft Config
    pub fn to_openraft_config(&self) -> Result<openraft::Config, openraft::ConfigError> {
        openraft::Config {
            cluster_name: "raftable".to_string(),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            install_snapshot_timeout: self.rpc_request_timeout_ms * 5,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        }
        .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout_ms, 5000);
        assert_eq!(config.rpc_request_timeout_ms, 2000);
        assert_eq!(config.max_log_size_bytes, 128 * 1024 * 1024);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.tablet_name, "default");
        assert_eq!(config.activate_max_retries, 100);
        assert!(config.compress_snapshots);
    }

    #[test]
    fn test_duration_conversions() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout(), Duration::from_millis(5000));
        assert_eq!(config.rpc_timeout(), Duration::from_millis(2000));
        assert_eq!(config.quorum_wait(), Duration::from_secs(120));
        assert_eq!(config.leader_advertise_delay(), Duration::from_secs(5));
        assert_eq!(config.leader_advertise_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_paths_include_node_id() {
        let config = RaftConfig {
            data_dir: PathBuf::from("/var/lib/raftable"),
            config_dir: PathBuf::from("/etc/raftable"),
            ..Default::default()
        };
        assert_eq!(
            config.log_dir("10.0.0.1"),
            PathBuf::from("/var/lib/raftable/raft/raftable-log_10.0.0.1")
        );
        assert_eq!(
            config.snapshot_dir("10.0.0.1"),
            PathBuf::from("/var/lib/raftable/raft/raftable-snapshot_10.0.0.1")
        );
        assert_eq!(
            config.member_file_path(),
            PathBuf::from("/etc/raftable/tablets.json")
        );
    }

    #[test]
    fn test_environment_overrides() {
        let mut vars = config::Map::<String, String>::new();
        vars.insert("RAFTABLE_DATA_DIR".into(), "/srv/db".into());
        vars.insert("RAFTABLE_MAX_LOG_SIZE".into(), "1048576".into());
        vars.insert("RAFTABLE_ELECTION_TIMEOUT_MS".into(), "750".into());

        let config =
            RaftConfig::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
                .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/db"));
        assert_eq!(config.max_log_size_bytes, 1_048_576);
        assert_eq!(config.election_timeout_ms, 750);
        // untouched keys keep their defaults
        assert_eq!(config.rpc_request_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let mut vars = config::Map::<String, String>::new();
        vars.insert("RAFTABLE_ELECTION_TIMEOUT_MS".into(), "soon".into());
        let result =
            RaftConfig::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(vars)));
        assert!(result.is_err());
    }

    #[test]
    fn test_to_openraft_config() {
        let openraft_config = RaftConfig::default().to_openraft_config().unwrap();
        assert_eq!(openraft_config.cluster_name, "raftable");
        assert_eq!(openraft_config.election_timeout_min, 5000);
        assert_eq!(openraft_config.election_timeout_max, 10000);
        assert_eq!(openraft_config.heartbeat_interval, 500);
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_election_timeout() {
        let config = RaftConfig {
            election_timeout_ms: 100,
            heartbeat_interval_ms: 500,
            ..Default::default()
        };
        assert!(config.to_openraft_config().is_err());
    }

    #[test]
    fn test_ensure_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = RaftConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.ensure_dirs("n1").is_ok());
        assert!(config.log_dir("n1").exists());
        assert!(config.snapshot_dir("n1").exists());
    }
}
