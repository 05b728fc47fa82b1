//! Configuration for a placement driver node

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`PDKV_NODE_ID=2`, `PDKV_RAFT_ADDR=...`)
pub const ENV_PREFIX: &str = "PDKV";

/// Placement driver node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdConfig {
    /// Node ID (unique, stable)
    #[serde(default = "default_node_id")]
    pub node_id: u64,

    /// Address the consensus substrate reaches this node at
    #[serde(default = "default_raft_addr")]
    pub raft_addr: String,

    /// HTTP API address, also advertised to peers
    #[serde(default = "default_service_addr")]
    pub service_addr: String,

    /// Start the PD group as its sole initial member
    #[serde(default)]
    pub bootstrap: bool,

    /// Service address of an existing PD member to join through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_service_addr: Option<String>,

    /// Replicas per region
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Self-announce period
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,

    /// Upper bound of the announce backoff after failures
    #[serde(default = "default_announce_max_backoff")]
    pub announce_max_backoff_ms: u64,

    /// Budget for membership changes (add/remove replica, membership reads)
    #[serde(default = "default_membership_change_timeout")]
    pub membership_change_timeout_ms: u64,

    /// Budget for proposals and reads against the PD group
    #[serde(default = "default_region_operation_timeout")]
    pub region_operation_timeout_ms: u64,

    /// Attempts to reach the seed when joining the PD group
    #[serde(default = "default_join_max_attempts")]
    pub join_max_attempts: usize,

    #[serde(default = "default_join_initial_backoff")]
    pub join_initial_backoff_ms: u64,

    /// Attempts to remove a temporary bootstrap replica before alerting
    #[serde(default = "default_cleanup_max_attempts")]
    pub cleanup_max_attempts: usize,

    #[serde(default = "default_cleanup_initial_backoff")]
    pub cleanup_initial_backoff_ms: u64,

    #[serde(default = "default_cleanup_max_backoff")]
    pub cleanup_max_backoff_ms: u64,

    /// Applied entries between two snapshots of a replica
    #[serde(default = "default_snapshot_entries")]
    pub snapshot_entries: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> u64 {
    1
}
fn default_raft_addr() -> String {
    "127.0.0.1:12001".to_string()
}
fn default_service_addr() -> String {
    "127.0.0.1:11001".to_string()
}
fn default_replication_factor() -> usize {
    3
}
fn default_announce_interval() -> u64 {
    3_000
}
fn default_announce_max_backoff() -> u64 {
    30_000
}
fn default_membership_change_timeout() -> u64 {
    3_000
}
fn default_region_operation_timeout() -> u64 {
    3_000
}
fn default_join_max_attempts() -> usize {
    10
}
fn default_join_initial_backoff() -> u64 {
    200
}
fn default_cleanup_max_attempts() -> usize {
    20
}
fn default_cleanup_initial_backoff() -> u64 {
    100
}
fn default_cleanup_max_backoff() -> u64 {
    5_000
}
fn default_snapshot_entries() -> u64 {
    512
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            raft_addr: default_raft_addr(),
            service_addr: default_service_addr(),
            bootstrap: false,
            seed_service_addr: None,
            replication_factor: default_replication_factor(),
            announce_interval_ms: default_announce_interval(),
            announce_max_backoff_ms: default_announce_max_backoff(),
            membership_change_timeout_ms: default_membership_change_timeout(),
            region_operation_timeout_ms: default_region_operation_timeout(),
            join_max_attempts: default_join_max_attempts(),
            join_initial_backoff_ms: default_join_initial_backoff(),
            cleanup_max_attempts: default_cleanup_max_attempts(),
            cleanup_initial_backoff_ms: default_cleanup_initial_backoff(),
            cleanup_max_backoff_ms: default_cleanup_max_backoff(),
            snapshot_entries: default_snapshot_entries(),
            log_level: default_log_level(),
        }
    }
}

impl PdConfig {
    /// Load from an optional TOML file, then `PDKV_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::read_sources(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`PdConfig::load`] without validation, for callers that fill in
    /// per-node fields afterwards.
    pub fn read_sources(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: PdConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::InvalidConfig("node_id must be non-zero".into()));
        }
        if self.raft_addr.trim().is_empty() {
            return Err(Error::InvalidConfig("raft_addr cannot be empty".into()));
        }
        self.service_socket_addr()?;
        if self.replication_factor == 0 {
            return Err(Error::InvalidConfig(
                "replication_factor must be at least 1".into(),
            ));
        }
        if !self.bootstrap && self.seed_service_addr.is_none() {
            return Err(Error::InvalidConfig(
                "a joining node needs seed_service_addr".into(),
            ));
        }
        if self.membership_change_timeout_ms == 0 || self.region_operation_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.announce_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "announce_interval_ms must be non-zero".into(),
            ));
        }
        if self.cleanup_max_attempts == 0 || self.join_max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn service_socket_addr(&self) -> Result<SocketAddr> {
        self.service_addr.parse().map_err(|_| {
            Error::InvalidConfig(format!("invalid service_addr: {}", self.service_addr))
        })
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn announce_max_backoff(&self) -> Duration {
        Duration::from_millis(self.announce_max_backoff_ms)
    }

    pub fn membership_change_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_change_timeout_ms)
    }

    pub fn region_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.region_operation_timeout_ms)
    }

    pub fn join_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.join_initial_backoff_ms)
    }

    pub fn cleanup_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_initial_backoff_ms)
    }

    pub fn cleanup_max_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_max_backoff_ms)
    }
}
