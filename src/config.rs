//! Configuration for the HA control plane.
//!
//! Deserialized from TOML by the external configuration loader (locating the
//! file and CLI overrides is out of scope); this module only defines the
//! shape, defaults, and validation.

use crate::error::{Error, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub health: HealthConfig,
    pub replication: ReplicationConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            health: HealthConfig::default(),
            replication: ReplicationConfig::default(),
            state: StateConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Config {
    /// Validates config consistency before `StartupOrchestrator` brings up
    /// any component. Raised at startup; never silently recovered (§7).
    pub fn validate(&self) -> Result<()> {
        if self.cluster.node_id.as_str().is_empty() {
            return Err(Error::Config("cluster.node_id must not be empty".into()));
        }
        if self.cluster.size == 0 {
            return Err(Error::Config("cluster.size must be at least 1".into()));
        }
        if self.cluster.size > 1 && self.cluster.seeds.is_empty() {
            return Err(Error::Config(
                "cluster.seeds must be non-empty when cluster.size > 1".into(),
            ));
        }
        if self.cluster.heartbeat_miss_threshold == 0 {
            return Err(Error::Config(
                "cluster.heartbeat_miss_threshold must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if !seen.insert(self.cluster.node_id.clone()) {
            return Err(Error::Config("duplicate node id in configuration".into()));
        }
        Ok(())
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster.size / 2 + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    pub seeds: Vec<String>,
    pub size: usize,
    pub priority: i64,
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    #[serde(with = "humantime_serde")]
    pub priority_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub suspect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dead_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub evict_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub forming_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "transferha-cluster".to_string(),
            node_id: NodeId::new("node-1"),
            address: "127.0.0.1".to_string(),
            port: 9000,
            seeds: Vec::new(),
            size: 1,
            priority: 0,
            gossip_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_miss_threshold: 4,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            priority_wait: Duration::from_millis(100),
            suspect_timeout: Duration::from_secs(3),
            dead_timeout: Duration::from_secs(6),
            evict_timeout: Duration::from_secs(30),
            forming_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            max_clock_skew: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub default_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    pub default_failure_threshold: u32,
    pub default_recovery_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(2),
            default_failure_threshold: 3,
            default_recovery_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    MasterSlave,
    MultiMaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    LastWriteWins,
    HigherVersion,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    pub conflict_policy: ConflictPolicy,
    #[serde(with = "humantime_serde")]
    pub max_catchup_window: Duration,
    pub replication_queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub backpressure_timeout: Duration,
    pub max_retries: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::MasterSlave,
            conflict_policy: ConflictPolicy::LastWriteWins,
            max_catchup_window: Duration::from_secs(60),
            replication_queue_capacity: 1024,
            backpressure_timeout: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(with = "humantime_serde")]
    pub tombstone_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
    #[serde(with = "humantime_serde")]
    pub default_lock_wait_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            tombstone_retention: Duration::from_secs(3600),
            max_clock_skew: Duration::from_secs(30),
            default_lock_wait_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub auto_failover_enabled: bool,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub recovery_wait_time: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub failback_stable_window: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            auto_failover_enabled: true,
            failure_threshold: 3,
            health_check_interval: Duration::from_secs(2),
            recovery_wait_time: Duration::from_secs(30),
            max_attempts: 3,
            failback_stable_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Per-group policy overrides, keyed by `group_id`; groups not listed
    /// use `FailoverPolicy::default()`.
    #[serde(default)]
    pub groups: std::collections::HashMap<String, FailoverPolicy>,
}
