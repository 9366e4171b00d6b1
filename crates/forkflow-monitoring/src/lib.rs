//! Monitoring for the Forkflow runtime: logging setup and metric recording.
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! hosting process installs a recorder.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to log output
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Log level filter used when `RUST_LOG` is not set (e.g., "info,forkflow_engine=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON logs instead of pretty ones
    #[serde(default)]
    pub enable_json_logging: bool,

    /// Register metric descriptions
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "forkflow".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            enable_metrics: true,
            environment: default_environment(),
        }
    }
}

/// Initialize logging and, when enabled, metric descriptions
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config)?;

    if config.enable_metrics {
        crate::metrics::describe_metrics();
    }

    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        "Monitoring initialized"
    );
    Ok(())
}

// Exported types
pub use crate::logging::LogExt;
pub use crate::metrics::{EngineMetrics, MemoryMetrics, RecoveryMetrics};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "forkflow");
        assert_eq!(config.log_filter, "info");
        assert!(config.enable_metrics);
        assert!(!config.enable_json_logging);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: MonitoringConfig =
            serde_json::from_str(r#"{"enable_json_logging": true}"#).unwrap();
        assert!(config.enable_json_logging);
        assert_eq!(config.environment, "dev");
    }
}
