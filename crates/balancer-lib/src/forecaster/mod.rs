//! Short-term load forecasting
//!
//! Fits a line per metric over recent history and projects it hour by
//! hour. The engine uses node forecasts to spot hosts that are about to
//! run hot; workload forecasts and the power report are operator-facing.

mod model;
mod power;

pub use model::{classify_forecast_trend, forecast_series, peak_hour, LinearModel, TREND_WINDOW};
pub use power::{assess, PowerReport, PowerThresholds};

use crate::analyzer::{series, TrendAnalyzer, DEFAULT_TREND_THRESHOLD};
use crate::error::AnalysisError;
use crate::models::{Forecast, HistoryPoint, MetricKind, WorkloadKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum history length before a regression is attempted
pub const DEFAULT_MIN_SAMPLES: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecasterConfig {
    pub min_samples: usize,
    pub trend_threshold: f64,
    /// Days of history fed to the model
    pub history_days: u32,
    pub power: PowerThresholds,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            trend_threshold: DEFAULT_TREND_THRESHOLD,
            history_days: 1,
            power: PowerThresholds::default(),
        }
    }
}

/// Per-metric projections for one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadForecast {
    pub workload_id: String,
    pub kind: WorkloadKind,
    pub node: String,
    pub horizon_hours: usize,
    pub metrics: BTreeMap<MetricKind, Forecast>,
}

/// CPU and memory projections for one node, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeForecast {
    pub node: String,
    pub horizon_hours: usize,
    pub samples: usize,
    pub cpu: Forecast,
    pub memory: Forecast,
}

pub struct Forecaster {
    analyzer: TrendAnalyzer,
    config: ForecasterConfig,
}

impl Forecaster {
    pub fn new(analyzer: TrendAnalyzer) -> Self {
        Self::with_config(analyzer, ForecasterConfig::default())
    }

    pub fn with_config(analyzer: TrendAnalyzer, config: ForecasterConfig) -> Self {
        Self { analyzer, config }
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    fn project(&self, points: &[HistoryPoint], kind: MetricKind, horizon: usize) -> Forecast {
        forecast_series(
            &series(points, kind),
            horizon,
            self.config.min_samples,
            self.config.trend_threshold,
        )
    }

    /// Project every metric a workload's history carries
    ///
    /// CPU and memory are always present; disk and network only when the
    /// history has values for them.
    pub async fn predict(
        &self,
        workload_id: &str,
        horizon_hours: usize,
    ) -> Result<WorkloadForecast, AnalysisError> {
        let (workload, history) = self
            .analyzer
            .workload_series(workload_id, self.config.history_days)
            .await?;

        let mut metrics = BTreeMap::new();
        for kind in MetricKind::HISTORICAL {
            let always = matches!(kind, MetricKind::Cpu | MetricKind::Memory);
            if always || history.iter().any(|p| p.value(kind).is_some()) {
                metrics.insert(kind, self.project(&history, kind, horizon_hours));
            }
        }

        debug!(
            workload = %workload.id,
            samples = history.len(),
            horizon_hours,
            "Workload forecast complete"
        );

        Ok(WorkloadForecast {
            workload_id: workload.id,
            kind: workload.kind,
            node: workload.node,
            horizon_hours,
            metrics,
        })
    }

    /// Project a node's CPU and memory usage
    pub async fn predict_node(
        &self,
        node: &str,
        horizon_hours: usize,
    ) -> Result<NodeForecast, AnalysisError> {
        let history = self
            .analyzer
            .node_series(node, self.config.history_days)
            .await?;

        Ok(NodeForecast {
            node: node.to_string(),
            horizon_hours,
            samples: history.len(),
            cpu: self.project(&history, MetricKind::Cpu, horizon_hours),
            memory: self.project(&history, MetricKind::Memory, horizon_hours),
        })
    }

    /// Idle and consolidation report for one node, or the whole cluster
    pub async fn analyze_power_efficiency(
        &self,
        node: Option<&str>,
    ) -> Result<PowerReport, AnalysisError> {
        match node {
            Some(node) => {
                let status = self.analyzer.api().node_status(node).await?;
                Ok(assess(
                    node,
                    status.cpu_percent,
                    status.memory.percent(),
                    &self.config.power,
                ))
            }
            None => {
                let efficiency = self
                    .analyzer
                    .cluster_efficiency(self.analyzer.exclude_nodes())
                    .await?;
                Ok(assess(
                    "cluster",
                    efficiency.cpu_usage,
                    efficiency.memory_usage,
                    &self.config.power,
                ))
            }
        }
    }
}
