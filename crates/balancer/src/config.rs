//! Daemon configuration
//!
//! Read from an optional TOML file, then overridden by `BALANCER_*`
//! environment variables (`__` between nested keys, e.g.
//! `BALANCER_ORCHESTRATOR__URL`).

use anyhow::{Context, Result};
use balancer_lib::collector::{AlertThresholds, CollectorConfig};
use balancer_lib::engine::BalancerConfig;
use balancer_lib::orchestrator::RestConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "balancer.toml";

/// Connection to the cluster orchestration API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
    pub verify_tls: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006/".to_string(),
            token: None,
            timeout_secs: 30,
            verify_tls: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.url.clone(),
            token: self.token.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            verify_tls: self.verify_tls,
        }
    }
}

/// Telemetry collection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub interval_secs: u64,
    pub buffer_capacity: usize,
    pub max_concurrency: usize,
    pub fetch_timeout_secs: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let defaults = CollectorConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            buffer_capacity: defaults.buffer_capacity,
            max_concurrency: defaults.max_concurrency,
            fetch_timeout_secs: defaults.fetch_timeout.as_secs(),
        }
    }
}

/// Where the engine reads the node history it forecasts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySourceKind {
    /// Historical series served by the orchestration API
    #[default]
    Orchestrator,
    /// Samples retained by the telemetry collector
    Telemetry,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Port of the health, metrics and control API
    pub api_port: u16,

    /// Cluster name attached to structured log events
    pub cluster_name: String,

    pub history_source: HistorySourceKind,

    pub orchestrator: OrchestratorSettings,
    pub collector: CollectorSettings,
    pub alerts: AlertThresholds,
    pub balancer: BalancerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            cluster_name: "default".to_string(),
            history_source: HistorySourceKind::default(),
            orchestrator: OrchestratorSettings::default(),
            collector: CollectorSettings::default(),
            alerts: AlertThresholds::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `BALANCER_CONFIG` (or `balancer.toml`) and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("BALANCER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(Path::new(&path))
    }

    /// Load configuration from `path`, if it exists, and environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("BALANCER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let config: DaemonConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        config.balancer.validate()?;
        Ok(config)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            interval: Duration::from_secs(self.collector.interval_secs),
            buffer_capacity: self.collector.buffer_capacity,
            max_concurrency: self.collector.max_concurrency,
            fetch_timeout: Duration::from_secs(self.collector.fetch_timeout_secs),
            exclude_nodes: self.balancer.exclude_nodes.clone(),
            ..CollectorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = DaemonConfig::load_from(Path::new("/nonexistent/balancer.toml")).unwrap();

        assert_eq!(config.collector.buffer_capacity, 1000);
        assert_eq!(config.history_source, HistorySourceKind::Orchestrator);
        assert_eq!(config.balancer, BalancerConfig::default());
        assert_eq!(config.collector_config().max_concurrency, 4);
    }

    #[test]
    fn test_file_overrides_nested_keys() {
        let file = write_config(
            r#"
cluster_name = "lab"
history_source = "telemetry"

[orchestrator]
url = "https://pve.lab:8006/"
verify_tls = false

[collector]
interval_secs = 15

[balancer]
auto_approve = true
cpu_threshold_high = 75.0
exclude_nodes = ["pve-backup"]
preferred_migration_hours = [0, 1]

[balancer.tuning]
prediction_gate = "sustained_average"
"#,
        );

        let config = DaemonConfig::load_from(file.path()).unwrap();

        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.history_source, HistorySourceKind::Telemetry);
        assert!(!config.orchestrator.rest_config().verify_tls);
        assert_eq!(config.orchestrator.timeout_secs, 30);
        assert_eq!(config.collector_config().interval, Duration::from_secs(15));
        assert!(config.balancer.auto_approve);
        assert_eq!(config.balancer.cpu_threshold_high, 75.0);
        assert!(config.collector_config().exclude_nodes.contains("pve-backup"));
        assert_eq!(
            config.balancer.preferred_migration_hours.iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(config.balancer.memory_threshold_high, 85.0);
    }

    #[test]
    fn test_invalid_balancer_section_rejected() {
        let file = write_config(
            r#"
[balancer]
cpu_threshold_low = 90.0
cpu_threshold_high = 80.0
"#,
        );

        assert!(DaemonConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_oversized_horizon_rejected() {
        let file = write_config(
            r#"
[balancer]
prediction_horizon = 100000
"#,
        );

        assert!(DaemonConfig::load_from(file.path()).is_err());
    }
}
