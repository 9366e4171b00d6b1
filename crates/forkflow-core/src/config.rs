//! Runtime configuration
//!
//! Defaults come from serde, an optional file and `FORKFLOW__*`
//! environment variables are layered on top with the `config` crate,
//! e.g. `FORKFLOW__RECOVERY__FAILURE_THRESHOLD=3`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::CoreError;

/// Eviction policy recorded on a distributed cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least Recently Used
    LRU,
    /// Least Frequently Used
    LFU,
    /// First In First Out
    FIFO,
    /// Never evict
    None,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::LRU
    }
}

/// Connection settings of the distributed store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Seed member addresses
    #[serde(default)]
    pub seed_addresses: Vec<String>,

    /// Connection and per-operation timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_cluster_name() -> String {
    "forkflow".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            seed_addresses: Vec::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl ClusterConfig {
    /// Connection timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Recovery framework settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failures that open a circuit breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before allowing a trial, in milliseconds
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Error contexts kept per execution for correlation
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Window of the time-proximity correlation, in seconds
    #[serde(default = "default_correlation_window_secs")]
    pub correlation_window_secs: u64,

    /// Timeout applied to a single compensating action, in milliseconds
    #[serde(default = "default_compensation_timeout_ms")]
    pub compensation_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_history_limit() -> usize {
    100
}

fn default_correlation_window_secs() -> u64 {
    300
}

fn default_compensation_timeout_ms() -> u64 {
    30_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            history_limit: default_history_limit(),
            correlation_window_secs: default_correlation_window_secs(),
            compensation_timeout_ms: default_compensation_timeout_ms(),
        }
    }
}

impl RecoveryConfig {
    /// Reset timeout of the circuit breaker
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Time-proximity correlation window
    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs(self.correlation_window_secs)
    }

    /// Timeout of a single compensating action
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.compensation_timeout_ms)
    }
}

/// Defaults applied to caches created without explicit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDefaults {
    /// Entry time to live in milliseconds, 0 for none
    #[serde(default)]
    pub ttl_ms: u64,

    /// Idle time after which a cache is reclaimed, in milliseconds
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,

    /// Eviction policy
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    /// Maximum entries per cache, 0 for unbounded
    #[serde(default)]
    pub max_entries: usize,

    /// Interval of the background reclaimer, in milliseconds
    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,
}

fn default_max_idle_ms() -> u64 {
    600_000
}

fn default_reclaim_interval_ms() -> u64 {
    60_000
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            max_idle_ms: default_max_idle_ms(),
            eviction_policy: EvictionPolicy::default(),
            max_entries: 0,
            reclaim_interval_ms: default_reclaim_interval_ms(),
        }
    }
}

impl CacheDefaults {
    /// Entry time to live
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }

    /// Maximum idle time
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    /// Reclaimer interval
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

/// Runtime configuration of a Forkflow node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Distributed store connection
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Recovery framework
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Cache defaults
    #[serde(default)]
    pub cache: CacheDefaults,
}

impl RuntimeConfig {
    /// Load configuration from an optional file and `FORKFLOW__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FORKFLOW")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.seed_addresses")
                .try_parsing(true),
        );

        let loaded: RuntimeConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;

        info!(
            cluster = %loaded.cluster.cluster_name,
            failure_threshold = loaded.recovery.failure_threshold,
            "Loaded runtime configuration"
        );
        Ok(loaded)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.recovery.failure_threshold == 0 {
            return Err(CoreError::ConfigurationError(
                "recovery.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.recovery.history_limit == 0 {
            return Err(CoreError::ConfigurationError(
                "recovery.history_limit must be at least 1".to_string(),
            ));
        }
        if self.cluster.connection_timeout_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "cluster.connection_timeout_ms must be positive".to_string(),
            ));
        }
        if self.cache.reclaim_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "cache.reclaim_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
