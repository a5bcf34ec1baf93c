//! Core data models for the cluster balancer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of workload hosted on a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Vm,
    Container,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 2] = [WorkloadKind::Vm, WorkloadKind::Container];

    /// VMs move live, containers have to be restarted on the target
    pub fn migration_mode(&self) -> MigrationMode {
        match self {
            WorkloadKind::Vm => MigrationMode::Online,
            WorkloadKind::Container => MigrationMode::Restart,
        }
    }

    /// Path segment used by the REST API for this kind
    pub fn api_segment(&self) -> &'static str {
        match self {
            WorkloadKind::Vm => "qemu",
            WorkloadKind::Container => "lxc",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Vm => write!(f, "vm"),
            WorkloadKind::Container => write!(f, "container"),
        }
    }
}

/// How a workload is moved between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    Online,
    Restart,
}

/// Memory usage in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

impl MemoryUsage {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

/// Node entry as returned by the node listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub online: bool,
    pub cpu_percent: f64,
    pub memory: MemoryUsage,
}

/// Current load of a single node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu_percent: f64,
    pub memory: MemoryUsage,
}

/// Workload entry as returned by the per-node listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub id: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub node: String,
    pub running: bool,
    /// CPU usage expressed in percent of the hosting node
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_max_bytes: u64,
    pub disk_bytes: u64,
}

impl WorkloadInfo {
    pub fn memory_percent(&self) -> f64 {
        MemoryUsage {
            used: self.memory_bytes,
            total: self.memory_max_bytes,
        }
        .percent()
    }
}

/// Live status of a single workload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub running: bool,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// One point of a historical resource series
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: i64,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_read: Option<f64>,
    pub disk_write: Option<f64>,
    pub net_in: Option<f64>,
    pub net_out: Option<f64>,
}

impl HistoryPoint {
    pub fn value(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::Cpu => self.cpu_percent,
            MetricKind::Memory => self.memory_percent,
            MetricKind::DiskRead => self.disk_read,
            MetricKind::DiskWrite => self.disk_write,
            MetricKind::NetIn => self.net_in,
            MetricKind::NetOut => self.net_out,
            MetricKind::StorageUsed | MetricKind::StorageTotal => None,
        }
    }
}

/// Storage pool usage on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub id: String,
    pub used: u64,
    pub total: u64,
}

/// Traffic counters of a node network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceUsage {
    pub name: String,
    pub in_bytes: f64,
    pub out_bytes: f64,
}

/// Resource metric identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    Memory,
    DiskRead,
    DiskWrite,
    NetIn,
    NetOut,
    StorageUsed,
    StorageTotal,
}

impl MetricKind {
    /// Metrics carried by historical series
    pub const HISTORICAL: [MetricKind; 6] = [
        MetricKind::Cpu,
        MetricKind::Memory,
        MetricKind::DiskRead,
        MetricKind::DiskWrite,
        MetricKind::NetIn,
        MetricKind::NetOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
            MetricKind::DiskRead => "disk_read",
            MetricKind::DiskWrite => "disk_write",
            MetricKind::NetIn => "net_in",
            MetricKind::NetOut => "net_out",
            MetricKind::StorageUsed => "storage_used",
            MetricKind::StorageTotal => "storage_total",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sample's `scope_id` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "kind")]
pub enum MetricScope {
    Node,
    Workload(WorkloadKind),
    Storage,
    Interface,
}

impl MetricScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricScope::Node => "node",
            MetricScope::Workload(WorkloadKind::Vm) => "vm",
            MetricScope::Workload(WorkloadKind::Container) => "container",
            MetricScope::Storage => "storage",
            MetricScope::Interface => "interface",
        }
    }
}

/// Metric family gathered by one collector fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorFamily {
    Workloads,
    Nodes,
    Storage,
    Network,
}

impl CollectorFamily {
    pub const ALL: [CollectorFamily; 4] = [
        CollectorFamily::Workloads,
        CollectorFamily::Nodes,
        CollectorFamily::Storage,
        CollectorFamily::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorFamily::Workloads => "workloads",
            CollectorFamily::Nodes => "nodes",
            CollectorFamily::Storage => "storage",
            CollectorFamily::Network => "network",
        }
    }
}

/// A single telemetry observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub scope: MetricScope,
    pub scope_id: String,
    pub node: String,
    pub value: f64,
    pub timestamp: i64,
    pub collector_source: CollectorFamily,
}

/// Direction of a metric over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Increasing => write!(f, "increasing"),
            Trend::Stable => write!(f, "stable"),
            Trend::Decreasing => write!(f, "decreasing"),
        }
    }
}

/// Summary statistics of one metric series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub average: f64,
    pub peak: f64,
    pub min: f64,
    pub trend: Trend,
}

impl AggregatedMetric {
    pub fn neutral() -> Self {
        Self {
            average: 0.0,
            peak: 0.0,
            min: 0.0,
            trend: Trend::Stable,
        }
    }
}

/// Cluster-wide load aggregate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterEfficiency {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_node_count: usize,
}

/// Projected values of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub next_horizon: Vec<f64>,
    pub trend: Trend,
    pub peak_hour_index: usize,
}

impl Forecast {
    pub fn peak(&self) -> f64 {
        self.next_horizon
            .get(self.peak_hour_index)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn mean(&self) -> f64 {
        if self.next_horizon.is_empty() {
            return 0.0;
        }
        self.next_horizon.iter().sum::<f64>() / self.next_horizon.len() as f64
    }
}

/// Workload eligible to be moved off its node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl From<&WorkloadInfo> for Candidate {
    fn from(workload: &WorkloadInfo) -> Self {
        Self {
            id: workload.id.clone(),
            name: workload.name.clone(),
            kind: workload.kind,
            cpu_percent: workload.cpu_percent,
            memory_bytes: workload.memory_bytes,
            disk_bytes: workload.disk_bytes,
        }
    }
}

/// Why a migration was planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    CurrentHighLoad,
    PredictedHighLoad,
    Consolidation,
}

impl std::fmt::Display for MigrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationReason::CurrentHighLoad => write!(f, "current_high_load"),
            MigrationReason::PredictedHighLoad => write!(f, "predicted_high_load"),
            MigrationReason::Consolidation => write!(f, "consolidation"),
        }
    }
}

/// Lifecycle state of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Success,
    Failed,
    Rejected,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MigrationStatus::Pending)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Success => write!(f, "success"),
            MigrationStatus::Failed => write!(f, "failed"),
            MigrationStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Resources of the workload at planning time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// A planned or completed workload migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub workload_id: String,
    pub workload_name: String,
    pub workload_kind: WorkloadKind,
    pub source_node: String,
    pub target_node: String,
    pub reason: MigrationReason,
    pub creation_time: DateTime<Utc>,
    pub status: MigrationStatus,
    pub resources: ResourceSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationRecord {
    pub fn plan(
        candidate: &Candidate,
        source_node: &str,
        target_node: &str,
        reason: MigrationReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workload_id: candidate.id.clone(),
            workload_name: candidate.name.clone(),
            workload_kind: candidate.kind,
            source_node: source_node.to_string(),
            target_node: target_node.to_string(),
            reason,
            creation_time: now,
            status: MigrationStatus::Pending,
            resources: ResourceSnapshot {
                cpu_percent: candidate.cpu_percent,
                memory_bytes: candidate.memory_bytes,
                disk_bytes: candidate.disk_bytes,
            },
            completion_time: None,
            result: None,
            error: None,
        }
    }

    /// Close a pending record with its final state
    pub fn finish(
        mut self,
        status: MigrationStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Self {
        self.status = status;
        self.completion_time = Some(Utc::now());
        self.result = result;
        self.error = error;
        self
    }
}

/// Uniform response envelope of the orchestration API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            id: "101".to_string(),
            name: "web".to_string(),
            kind: WorkloadKind::Vm,
            cpu_percent: 30.0,
            memory_bytes: 2 << 30,
            disk_bytes: 10 << 30,
        }
    }

    #[test]
    fn test_migration_mode_follows_kind() {
        assert_eq!(WorkloadKind::Vm.migration_mode(), MigrationMode::Online);
        assert_eq!(
            WorkloadKind::Container.migration_mode(),
            MigrationMode::Restart
        );
    }

    #[test]
    fn test_memory_percent_handles_zero_total() {
        let usage = MemoryUsage { used: 10, total: 0 };
        assert_eq!(usage.percent(), 0.0);

        let usage = MemoryUsage {
            used: 25,
            total: 100,
        };
        assert!((usage.percent() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_planned_record_is_pending() {
        let record = MigrationRecord::plan(
            &candidate(),
            "node-a",
            "node-b",
            MigrationReason::CurrentHighLoad,
            Utc::now(),
        );

        assert_eq!(record.status, MigrationStatus::Pending);
        assert!(!record.status.is_terminal());
        assert!(record.completion_time.is_none());
        assert_eq!(record.resources.cpu_percent, 30.0);
    }

    #[test]
    fn test_finish_sets_completion_time() {
        let record = MigrationRecord::plan(
            &candidate(),
            "node-a",
            "node-b",
            MigrationReason::Consolidation,
            Utc::now(),
        )
        .finish(MigrationStatus::Failed, None, Some("target offline".into()));

        assert!(record.status.is_terminal());
        assert!(record.completion_time.is_some());
        assert_eq!(record.error.as_deref(), Some("target offline"));
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&MigrationReason::PredictedHighLoad).unwrap();
        assert_eq!(json, "\"predicted_high_load\"");
    }

    #[test]
    fn test_forecast_peak_and_mean() {
        let forecast = Forecast {
            next_horizon: vec![1.0, 5.0, 3.0],
            trend: Trend::Stable,
            peak_hour_index: 1,
        };
        assert_eq!(forecast.peak(), 5.0);
        assert!((forecast.mean() - 3.0).abs() < f64::EPSILON);
    }
}
