//! Trend and efficiency analysis
//!
//! Turns historical resource series into summary statistics with a
//! three-way trend label, produces advisory right-sizing recommendations
//! per workload, and computes cluster-wide CPU/memory efficiency.

use crate::collector::MetricsBuffer;
use crate::error::{AnalysisError, OrchestratorError};
use crate::models::{
    AggregatedMetric, ClusterEfficiency, HistoryPoint, MetricKind, MetricSample, MetricScope, Trend,
    WorkloadInfo, WorkloadKind,
};
use crate::orchestrator::{
    async_trait, eligible_nodes, locate_workload, OrchestrationApi, Timeframe,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Relative change between window halves below which a series is stable
pub const DEFAULT_TREND_THRESHOLD: f64 = 0.10;

/// Summarize a series into average, peak, min and trend
///
/// The trend compares the mean of the first half of the window with the
/// mean of the second half. A change smaller than `trend_threshold` times
/// the first-half mean is stable. An empty series yields the neutral
/// aggregate.
pub fn aggregate(values: &[f64], trend_threshold: f64) -> AggregatedMetric {
    if values.is_empty() {
        return AggregatedMetric::neutral();
    }

    let average = mean(values);
    let peak = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);

    let trend = if values.len() < 2 {
        Trend::Stable
    } else {
        let (first, second) = values.split_at(values.len() / 2);
        classify_change(mean(first), mean(second), trend_threshold)
    };

    AggregatedMetric {
        average,
        peak,
        min,
        trend,
    }
}

/// Label the move from `before` to `after`
pub(crate) fn classify_change(before: f64, after: f64, threshold: f64) -> Trend {
    let change = after - before;
    if change == 0.0 || change.abs() < threshold * before.abs() {
        Trend::Stable
    } else if change > 0.0 {
        Trend::Increasing
    } else {
        Trend::Decreasing
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Values of one metric across a history, skipping gaps
pub fn series(points: &[HistoryPoint], kind: MetricKind) -> Vec<f64> {
    points.iter().filter_map(|p| p.value(kind)).collect()
}

/// Where historical series come from
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn workload_history(
        &self,
        workload: &WorkloadInfo,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, OrchestratorError>;

    async fn node_history(&self, node: &str, days: u32)
        -> Result<Vec<HistoryPoint>, OrchestratorError>;
}

/// Reads history from the orchestration API's RRD series
pub struct OrchestratorHistory {
    api: Arc<dyn OrchestrationApi>,
}

impl OrchestratorHistory {
    pub fn new(api: Arc<dyn OrchestrationApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl HistorySource for OrchestratorHistory {
    async fn workload_history(
        &self,
        workload: &WorkloadInfo,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, OrchestratorError> {
        self.api
            .workload_history(
                &workload.node,
                &workload.id,
                workload.kind,
                Timeframe::for_days(days),
            )
            .await
    }

    async fn node_history(
        &self,
        node: &str,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, OrchestratorError> {
        self.api.node_history(node, Timeframe::for_days(days)).await
    }
}

/// Reads history from the collector's sample buffer
///
/// Only CPU and memory are buffered per workload; nodes also get network
/// traffic summed over their interfaces.
pub struct BufferedHistory {
    buffer: Arc<RwLock<MetricsBuffer>>,
}

impl BufferedHistory {
    pub fn new(buffer: Arc<RwLock<MetricsBuffer>>) -> Self {
        Self { buffer }
    }

    async fn collect(
        &self,
        days: u32,
        wanted: impl Fn(&MetricSample) -> bool,
    ) -> Vec<HistoryPoint> {
        let window = if days == 0 { 3600 } else { i64::from(days) * 86_400 };
        let since = chrono::Utc::now().timestamp() - window;

        let buffer = self.buffer.read().await;
        let mut points: BTreeMap<i64, HistoryPoint> = BTreeMap::new();
        for sample in buffer.recent(None) {
            if sample.timestamp < since || !wanted(&sample) {
                continue;
            }
            let point = points.entry(sample.timestamp).or_insert_with(|| HistoryPoint {
                timestamp: sample.timestamp,
                ..Default::default()
            });
            match (sample.scope, sample.kind) {
                (MetricScope::Interface, MetricKind::NetIn) => {
                    *point.net_in.get_or_insert(0.0) += sample.value;
                }
                (MetricScope::Interface, MetricKind::NetOut) => {
                    *point.net_out.get_or_insert(0.0) += sample.value;
                }
                (_, MetricKind::Cpu) => point.cpu_percent = Some(sample.value),
                (_, MetricKind::Memory) => point.memory_percent = Some(sample.value),
                _ => {}
            }
        }
        points.into_values().collect()
    }
}

#[async_trait]
impl HistorySource for BufferedHistory {
    async fn workload_history(
        &self,
        workload: &WorkloadInfo,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, OrchestratorError> {
        let scope = MetricScope::Workload(workload.kind);
        Ok(self
            .collect(days, |s| s.scope == scope && s.scope_id == workload.id)
            .await)
    }

    async fn node_history(
        &self,
        node: &str,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, OrchestratorError> {
        Ok(self
            .collect(days, |s| match s.scope {
                MetricScope::Node => s.scope_id == node,
                MetricScope::Interface => s.node == node,
                _ => false,
            })
            .await)
    }
}

/// Direction of an advisory sizing change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationAction {
    Reduce,
    Increase,
}

/// Advisory allocation change for one resource of a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub resource: MetricKind,
    pub action: RecommendationAction,
    pub message: String,
}

/// Aggregated history of one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadAnalysis {
    pub workload_id: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub node: String,
    pub days: u32,
    pub metrics: BTreeMap<MetricKind, AggregatedMetric>,
    pub recommendations: Vec<Recommendation>,
}

/// Reduce when both average and peak stay under these, in percent
const CPU_REDUCE: (f64, f64) = (20.0, 40.0);
const MEMORY_REDUCE: (f64, f64) = (30.0, 50.0);
const INCREASE_PEAK: f64 = 90.0;
const INCREASE_AVERAGE: f64 = 70.0;

fn recommend(kind: MetricKind, metric: &AggregatedMetric) -> Option<Recommendation> {
    let (reduce_avg, reduce_peak) = match kind {
        MetricKind::Cpu => CPU_REDUCE,
        MetricKind::Memory => MEMORY_REDUCE,
        _ => return None,
    };

    if metric.average < reduce_avg && metric.peak < reduce_peak {
        return Some(Recommendation {
            resource: kind,
            action: RecommendationAction::Reduce,
            message: format!(
                "{} averages {:.1}% with a peak of {:.1}%, consider reducing the allocation",
                kind, metric.average, metric.peak
            ),
        });
    }

    let rising = metric.average > INCREASE_AVERAGE && metric.trend == Trend::Increasing;
    if metric.peak > INCREASE_PEAK || rising {
        return Some(Recommendation {
            resource: kind,
            action: RecommendationAction::Increase,
            message: format!(
                "{} peaks at {:.1}% (average {:.1}%, {}), consider increasing the allocation",
                kind, metric.peak, metric.average, metric.trend
            ),
        });
    }
    None
}

/// Historical trend analysis over a pluggable history source
#[derive(Clone)]
pub struct TrendAnalyzer {
    api: Arc<dyn OrchestrationApi>,
    source: Arc<dyn HistorySource>,
    exclude_nodes: HashSet<String>,
    trend_threshold: f64,
}

impl TrendAnalyzer {
    pub fn new(api: Arc<dyn OrchestrationApi>) -> Self {
        Self {
            source: Arc::new(OrchestratorHistory::new(api.clone())),
            api,
            exclude_nodes: HashSet::new(),
            trend_threshold: DEFAULT_TREND_THRESHOLD,
        }
    }

    /// Read history from `source` instead of the orchestration API
    pub fn with_source(mut self, source: Arc<dyn HistorySource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_exclude_nodes(mut self, exclude_nodes: HashSet<String>) -> Self {
        self.exclude_nodes = exclude_nodes;
        self
    }

    pub fn with_trend_threshold(mut self, threshold: f64) -> Self {
        self.trend_threshold = threshold;
        self
    }

    pub fn api(&self) -> &Arc<dyn OrchestrationApi> {
        &self.api
    }

    pub fn trend_threshold(&self) -> f64 {
        self.trend_threshold
    }

    pub fn exclude_nodes(&self) -> &HashSet<String> {
        &self.exclude_nodes
    }

    /// Locate a workload and fetch its history
    pub async fn workload_series(
        &self,
        workload_id: &str,
        days: u32,
    ) -> Result<(WorkloadInfo, Vec<HistoryPoint>), AnalysisError> {
        let workload = locate_workload(self.api.as_ref(), workload_id, &self.exclude_nodes)
            .await?
            .ok_or_else(|| AnalysisError::WorkloadNotFound(workload_id.to_string()))?;
        let history = self.source.workload_history(&workload, days).await?;
        Ok((workload, history))
    }

    pub async fn node_series(
        &self,
        node: &str,
        days: u32,
    ) -> Result<Vec<HistoryPoint>, AnalysisError> {
        Ok(self.source.node_history(node, days).await?)
    }

    /// Aggregate every historical metric of a workload over `days`
    pub async fn analyze_workload(
        &self,
        workload_id: &str,
        days: u32,
    ) -> Result<WorkloadAnalysis, AnalysisError> {
        let (workload, history) = self.workload_series(workload_id, days).await?;

        let mut metrics = BTreeMap::new();
        let mut recommendations = Vec::new();
        for kind in MetricKind::HISTORICAL {
            let values = series(&history, kind);
            let metric = aggregate(&values, self.trend_threshold);
            if !values.is_empty() {
                recommendations.extend(recommend(kind, &metric));
            }
            metrics.insert(kind, metric);
        }

        debug!(
            workload = %workload.id,
            points = history.len(),
            recommendations = recommendations.len(),
            "Workload analysis complete"
        );

        Ok(WorkloadAnalysis {
            workload_id: workload.id,
            name: workload.name,
            kind: workload.kind,
            node: workload.node,
            days,
            metrics,
            recommendations,
        })
    }

    /// Average current load across online, non-excluded nodes
    ///
    /// Nodes that do not answer are left out; fails only when none do.
    pub async fn cluster_efficiency(
        &self,
        exclude_nodes: &HashSet<String>,
    ) -> Result<ClusterEfficiency, AnalysisError> {
        let nodes = eligible_nodes(self.api.as_ref(), exclude_nodes).await?;

        let mut cpu = Vec::with_capacity(nodes.len());
        let mut memory = Vec::with_capacity(nodes.len());
        for node in &nodes {
            match self.api.node_status(&node.id).await {
                Ok(status) => {
                    cpu.push(status.cpu_percent);
                    memory.push(status.memory.percent());
                }
                Err(e) => debug!(node = %node.id, error = %e, "Skipping unreachable node"),
            }
        }

        if cpu.is_empty() {
            return Err(AnalysisError::NoReachableNodes);
        }

        Ok(ClusterEfficiency {
            cpu_usage: mean(&cpu),
            memory_usage: mean(&memory),
            active_node_count: cpu.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectorFamily;
    use crate::orchestrator::InMemoryCluster;

    fn point(timestamp: i64, cpu: f64, memory: f64) -> HistoryPoint {
        HistoryPoint {
            timestamp,
            cpu_percent: Some(cpu),
            memory_percent: Some(memory),
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_empty_is_neutral() {
        assert_eq!(aggregate(&[], 0.1), AggregatedMetric::neutral());
    }

    #[test]
    fn test_aggregate_statistics() {
        let metric = aggregate(&[10.0, 20.0, 30.0, 40.0], 0.1);
        assert!((metric.average - 25.0).abs() < 1e-9);
        assert_eq!(metric.peak, 40.0);
        assert_eq!(metric.min, 10.0);
        assert_eq!(metric.trend, Trend::Increasing);
    }

    #[test]
    fn test_aggregate_trend_threshold() {
        // 5% rise stays stable, 20% drop does not
        assert_eq!(aggregate(&[100.0, 100.0, 105.0, 105.0], 0.1).trend, Trend::Stable);
        assert_eq!(aggregate(&[100.0, 100.0, 80.0, 80.0], 0.1).trend, Trend::Decreasing);
        assert_eq!(aggregate(&[0.0, 0.0, 0.0, 0.0], 0.1).trend, Trend::Stable);
        assert_eq!(aggregate(&[42.0], 0.1).trend, Trend::Stable);
    }

    #[test]
    fn test_recommendations() {
        let idle = aggregate(&[5.0, 10.0, 8.0], 0.1);
        let reduce = recommend(MetricKind::Cpu, &idle).unwrap();
        assert_eq!(reduce.action, RecommendationAction::Reduce);

        let spiky = aggregate(&[40.0, 95.0, 50.0], 0.1);
        let increase = recommend(MetricKind::Memory, &spiky).unwrap();
        assert_eq!(increase.action, RecommendationAction::Increase);

        let rising = aggregate(&[65.0, 68.0, 80.0, 85.0], 0.1);
        assert_eq!(
            recommend(MetricKind::Cpu, &rising).map(|r| r.action),
            Some(RecommendationAction::Increase)
        );

        let steady = aggregate(&[50.0, 55.0, 50.0], 0.1);
        assert!(recommend(MetricKind::Cpu, &steady).is_none());
        assert!(recommend(MetricKind::NetIn, &idle).is_none());
    }

    #[tokio::test]
    async fn test_analyze_workload_from_api_history() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("pve1", 50.0, 1 << 30, 8 << 30).await;
        cluster
            .add_workload(InMemoryCluster::workload("101", WorkloadKind::Vm, "pve1", 5.0, 1 << 30))
            .await;
        cluster
            .set_workload_history(
                "101",
                (0..10).map(|i| point(i, 5.0, 60.0)).collect(),
            )
            .await;

        let analyzer = TrendAnalyzer::new(cluster);
        let analysis = analyzer.analyze_workload("101", 7).await.unwrap();

        assert_eq!(analysis.node, "pve1");
        assert_eq!(analysis.metrics.len(), MetricKind::HISTORICAL.len());
        assert_eq!(analysis.metrics[&MetricKind::Cpu].average, 5.0);
        assert_eq!(analysis.metrics[&MetricKind::DiskRead], AggregatedMetric::neutral());
        assert_eq!(analysis.recommendations.len(), 1);
        assert_eq!(analysis.recommendations[0].resource, MetricKind::Cpu);
    }

    #[tokio::test]
    async fn test_analyze_unknown_workload() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("pve1", 50.0, 1 << 30, 8 << 30).await;

        let analyzer = TrendAnalyzer::new(cluster);
        let err = analyzer.analyze_workload("999", 1).await.unwrap_err();
        assert!(matches!(err, AnalysisError::WorkloadNotFound(_)));
    }

    #[tokio::test]
    async fn test_cluster_efficiency_skips_excluded_and_offline() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("a", 20.0, 2 << 30, 8 << 30).await;
        cluster.add_node("b", 40.0, 6 << 30, 8 << 30).await;
        cluster.add_node("c", 90.0, 8 << 30, 8 << 30).await;
        cluster.add_node("d", 90.0, 8 << 30, 8 << 30).await;
        cluster.set_node_online("d", false).await;

        let analyzer = TrendAnalyzer::new(cluster);
        let exclude: HashSet<String> = ["c".to_string()].into_iter().collect();
        let efficiency = analyzer.cluster_efficiency(&exclude).await.unwrap();

        assert_eq!(efficiency.active_node_count, 2);
        assert!((efficiency.cpu_usage - 30.0).abs() < 1e-9);
        assert!((efficiency.memory_usage - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cluster_efficiency_fails_without_reachable_nodes() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("a", 20.0, 2 << 30, 8 << 30).await;
        cluster.fail_node("a").await;

        let analyzer = TrendAnalyzer::new(cluster);
        let err = analyzer.cluster_efficiency(&HashSet::new()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NoReachableNodes));
    }

    #[tokio::test]
    async fn test_buffered_history_groups_by_timestamp() {
        let now = chrono::Utc::now().timestamp();
        let sample = |kind, scope, scope_id: &str, value, timestamp| MetricSample {
            kind,
            scope,
            scope_id: scope_id.to_string(),
            node: "pve1".to_string(),
            value,
            timestamp,
            collector_source: CollectorFamily::Nodes,
        };

        let mut buffer = MetricsBuffer::default();
        buffer.push_batch([
            sample(MetricKind::Cpu, MetricScope::Node, "pve1", 10.0, now - 60),
            sample(MetricKind::Memory, MetricScope::Node, "pve1", 40.0, now - 60),
            sample(MetricKind::NetIn, MetricScope::Interface, "vmbr0", 100.0, now - 60),
            sample(MetricKind::NetIn, MetricScope::Interface, "vmbr1", 50.0, now - 60),
            sample(MetricKind::Cpu, MetricScope::Node, "pve1", 20.0, now),
            sample(MetricKind::Cpu, MetricScope::Node, "pve2", 99.0, now),
            sample(MetricKind::Cpu, MetricScope::Node, "pve1", 70.0, now - 10 * 86_400),
        ]);

        let history = BufferedHistory::new(Arc::new(RwLock::new(buffer)));
        let points = history.node_history("pve1", 1).await.unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].cpu_percent, Some(10.0));
        assert_eq!(points[0].memory_percent, Some(40.0));
        assert_eq!(points[0].net_in, Some(150.0));
        assert_eq!(points[1].cpu_percent, Some(20.0));
        assert_eq!(points[1].memory_percent, None);
    }
}
