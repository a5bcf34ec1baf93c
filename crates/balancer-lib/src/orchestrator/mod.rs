//! Cluster orchestration API contract
//!
//! The balancer never talks to hypervisors directly. Everything it knows
//! about nodes and workloads, and every migration it issues, goes through
//! an [`OrchestrationApi`] implementation:
//! - [`RestOrchestrator`] for a Proxmox-style REST endpoint
//! - [`InMemoryCluster`] for tests and offline dry runs

mod memory;
mod rest;

pub use memory::{InMemoryCluster, MigrationCall};
pub use rest::{RestConfig, RestOrchestrator};

use crate::error::OrchestratorError;
use crate::models::{
    ApiResponse, HistoryPoint, InterfaceUsage, MigrationMode, NodeInfo, NodeStatus,
    StorageUsage, WorkloadInfo, WorkloadKind, WorkloadStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

pub use async_trait::async_trait;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Resolution of a historical series request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Timeframe {
    /// Smallest timeframe that covers the requested number of days
    pub fn for_days(days: u32) -> Self {
        match days {
            0 => Timeframe::Hour,
            1 => Timeframe::Day,
            2..=7 => Timeframe::Week,
            8..=31 => Timeframe::Month,
            _ => Timeframe::Year,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Hour => "hour",
            Timeframe::Day => "day",
            Timeframe::Week => "week",
            Timeframe::Month => "month",
            Timeframe::Year => "year",
        }
    }
}

/// Contract of the external cluster orchestration API
#[async_trait]
pub trait OrchestrationApi: Send + Sync {
    /// List every cluster member with its current load
    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>>;

    /// Current load of one node
    async fn node_status(&self, node: &str) -> OrchestratorResult<NodeStatus>;

    /// Workloads of one kind hosted on a node
    async fn list_workloads(
        &self,
        node: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<Vec<WorkloadInfo>>;

    /// Live status of a single workload
    async fn workload_status(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<WorkloadStatus>;

    /// Move a workload to another node
    ///
    /// A refused migration is reported through `success = false`; `Err`
    /// is reserved for transport failures.
    async fn migrate(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
        target: &str,
        mode: MigrationMode,
    ) -> OrchestratorResult<ApiResponse<String>>;

    /// Historical load series of a node
    async fn node_history(
        &self,
        node: &str,
        timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>>;

    /// Historical load series of a workload
    async fn workload_history(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
        timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>>;

    /// Storage pools visible on a node
    async fn storage_usage(&self, node: &str) -> OrchestratorResult<Vec<StorageUsage>>;

    /// Network traffic counters of a node
    async fn network_usage(&self, node: &str) -> OrchestratorResult<Vec<InterfaceUsage>>;
}

/// Reference to one workload that knows how to query and move itself
pub struct WorkloadHandle<'a> {
    api: &'a dyn OrchestrationApi,
    pub node: String,
    pub id: String,
    pub kind: WorkloadKind,
}

impl<'a> WorkloadHandle<'a> {
    pub fn new(
        api: &'a dyn OrchestrationApi,
        node: impl Into<String>,
        id: impl Into<String>,
        kind: WorkloadKind,
    ) -> Self {
        Self {
            api,
            node: node.into(),
            id: id.into(),
            kind,
        }
    }

    pub async fn status(&self) -> OrchestratorResult<WorkloadStatus> {
        self.api.workload_status(&self.node, &self.id, self.kind).await
    }

    pub async fn history(&self, timeframe: Timeframe) -> OrchestratorResult<Vec<HistoryPoint>> {
        self.api
            .workload_history(&self.node, &self.id, self.kind, timeframe)
            .await
    }

    /// Migrate using the mode this workload kind supports
    pub async fn migrate(&self, target: &str) -> OrchestratorResult<ApiResponse<String>> {
        self.api
            .migrate(
                &self.node,
                &self.id,
                self.kind,
                target,
                self.kind.migration_mode(),
            )
            .await
    }
}

/// Online nodes that are not excluded from balancing
pub async fn eligible_nodes(
    api: &dyn OrchestrationApi,
    exclude_nodes: &HashSet<String>,
) -> OrchestratorResult<Vec<NodeInfo>> {
    let nodes = api.list_nodes().await?;
    Ok(nodes
        .into_iter()
        .filter(|n| n.online && !exclude_nodes.contains(&n.id))
        .collect())
}

/// All workloads of both kinds on a node
pub async fn node_workloads(
    api: &dyn OrchestrationApi,
    node: &str,
) -> OrchestratorResult<Vec<WorkloadInfo>> {
    let mut workloads = Vec::new();
    for kind in WorkloadKind::ALL {
        workloads.extend(api.list_workloads(node, kind).await?);
    }
    Ok(workloads)
}

/// Find which node currently hosts a workload
///
/// Nodes that fail to answer are skipped.
pub async fn locate_workload(
    api: &dyn OrchestrationApi,
    workload_id: &str,
    exclude_nodes: &HashSet<String>,
) -> OrchestratorResult<Option<WorkloadInfo>> {
    for node in eligible_nodes(api, exclude_nodes).await? {
        match node_workloads(api, &node.id).await {
            Ok(workloads) => {
                if let Some(found) = workloads.into_iter().find(|w| w.id == workload_id) {
                    return Ok(Some(found));
                }
            }
            Err(e) => {
                debug!(node = %node.id, error = %e, "Skipping node while locating workload");
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_for_days() {
        assert_eq!(Timeframe::for_days(0), Timeframe::Hour);
        assert_eq!(Timeframe::for_days(1), Timeframe::Day);
        assert_eq!(Timeframe::for_days(7), Timeframe::Week);
        assert_eq!(Timeframe::for_days(30), Timeframe::Month);
        assert_eq!(Timeframe::for_days(90), Timeframe::Year);
    }

    #[tokio::test]
    async fn test_locate_workload_skips_failing_nodes() {
        let cluster = InMemoryCluster::new();
        cluster.add_node("node-a", 10.0, 1 << 30, 8 << 30).await;
        cluster.add_node("node-b", 10.0, 1 << 30, 8 << 30).await;
        cluster
            .add_workload(InMemoryCluster::workload(
                "200",
                WorkloadKind::Container,
                "node-b",
                5.0,
                256 << 20,
            ))
            .await;
        cluster.fail_node("node-a").await;

        let found = locate_workload(&cluster, "200", &HashSet::new())
            .await
            .unwrap()
            .expect("workload should be found");
        assert_eq!(found.node, "node-b");
        assert_eq!(found.kind, WorkloadKind::Container);
    }

    #[tokio::test]
    async fn test_eligible_nodes_filters_excluded_and_offline() {
        let cluster = InMemoryCluster::new();
        cluster.add_node("node-a", 10.0, 1 << 30, 8 << 30).await;
        cluster.add_node("node-b", 10.0, 1 << 30, 8 << 30).await;
        cluster.add_node("node-c", 10.0, 1 << 30, 8 << 30).await;
        cluster.set_node_online("node-c", false).await;

        let exclude: HashSet<String> = ["node-b".to_string()].into_iter().collect();
        let nodes = eligible_nodes(&cluster, &exclude).await.unwrap();
        let ids: Vec<_> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["node-a"]);
    }

    #[tokio::test]
    async fn test_workload_handle_uses_kind_mode() {
        let cluster = InMemoryCluster::new();
        cluster.add_node("node-a", 10.0, 1 << 30, 8 << 30).await;
        cluster.add_node("node-b", 10.0, 1 << 30, 8 << 30).await;
        cluster
            .add_workload(InMemoryCluster::workload(
                "300",
                WorkloadKind::Container,
                "node-a",
                5.0,
                256 << 20,
            ))
            .await;

        let handle = WorkloadHandle::new(&cluster, "node-a", "300", WorkloadKind::Container);
        let response = handle.migrate("node-b").await.unwrap();
        assert!(response.success);

        let calls = cluster.migrations().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mode, MigrationMode::Restart);
    }
}
