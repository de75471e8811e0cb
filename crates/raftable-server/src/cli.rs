//! Command line arguments
//!
//! Arguments override the `RAFTABLE_*` environment configuration, which in
//! turn overrides the built-in defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::Environment;
use raftable_cluster::ControllerNode;
use raftable_consistency::{RaftConfig, Tablet};
use tracing::Level;

use crate::logging::{LogRotation, LoggingConfig};

#[derive(Debug, Clone, Parser)]
#[command(name = "raftable-server", version, about = "Replicated versioned table database node")]
pub struct Cli {
    /// Member id of this node
    #[arg(long = "node-id", env = "RAFTABLE_NODE_ID")]
    pub node_id: String,

    /// Listen address; required when the node is not a tablet member
    #[arg(long = "listen", env = "RAFTABLE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Directory holding tablets.json
    #[arg(long = "config-dir")]
    pub config_dir: Option<PathBuf>,

    /// Root directory for logs and snapshots
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Cluster heartbeat period in milliseconds
    #[arg(long = "heartbeat-ms", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Default log level when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: Level,

    /// Write rolling log files to this directory
    #[arg(long = "log-dir", env = "RAFTABLE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long = "log-rotation", value_enum, default_value_t = LogRotation::Daily)]
    pub log_rotation: LogRotation,

    /// Disable console log output
    #[arg(long = "no-console-log")]
    pub no_console_log: bool,
}

impl Cli {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            log_dir: self.log_dir.clone(),
            level: self.log_level,
            console_output: !self.no_console_log,
            rotation: self.log_rotation,
        }
    }

    /// Environment configuration with command line overrides applied
    pub fn raft_config(&self) -> anyhow::Result<RaftConfig> {
        self.raft_config_from(Environment::with_prefix(raftable_consistency::raft::config::ENV_PREFIX))
    }

    pub fn raft_config_from(&self, environment: Environment) -> anyhow::Result<RaftConfig> {
        let mut config = RaftConfig::from_environment(environment)?;
        if let Some(dir) = &self.config_dir {
            config.config_dir = dir.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// This node's descriptor: its tablet entry, else the listen address
    pub fn local_node(&self, tablet: &Tablet) -> anyhow::Result<ControllerNode> {
        if let Some(node) = tablet.members.iter().find(|m| m.id.as_str() == self.node_id) {
            return Ok(node.clone());
        }
        let addr = self.listen.ok_or_else(|| {
            anyhow::anyhow!(
                "{} is not a member of tablet {}; --listen is required",
                self.node_id,
                tablet.name
            )
        })?;
        Ok(ControllerNode::new(
            self.node_id.as_str(),
            addr.ip().to_string(),
            addr.port(),
        ))
    }
}
