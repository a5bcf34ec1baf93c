//! In-process cluster model
//!
//! Keeps nodes, workloads and their histories in memory and applies
//! migrations by moving workloads between nodes. Nodes, the node listing
//! and the storage endpoint can be made to fail, and the network endpoint
//! can be stalled, to exercise the error paths of the collector and engine.

use super::{async_trait, OrchestrationApi, OrchestratorResult, Timeframe};
use crate::error::OrchestratorError;
use crate::models::{
    ApiResponse, HistoryPoint, InterfaceUsage, MemoryUsage, MigrationMode, NodeInfo,
    NodeStatus, StorageUsage, WorkloadInfo, WorkloadKind, WorkloadStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

/// A migrate call received by the in-memory cluster
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCall {
    pub workload_id: String,
    pub kind: WorkloadKind,
    pub source: String,
    pub target: String,
    pub mode: MigrationMode,
}

#[derive(Debug, Clone)]
struct SimNode {
    online: bool,
    cpu_percent: f64,
    memory: MemoryUsage,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, SimNode>,
    workloads: BTreeMap<String, WorkloadInfo>,
    node_history: HashMap<String, Vec<HistoryPoint>>,
    workload_history: HashMap<String, Vec<HistoryPoint>>,
    storage: HashMap<String, Vec<StorageUsage>>,
    interfaces: HashMap<String, Vec<InterfaceUsage>>,
    failing_nodes: HashSet<String>,
    listing_fails: bool,
    storage_fails: bool,
    network_delay: Option<Duration>,
    refused_migrations: HashSet<String>,
    migrations: Vec<MigrationCall>,
}

impl ClusterState {
    fn reachable(&self, node: &str) -> OrchestratorResult<&SimNode> {
        if self.failing_nodes.contains(node) {
            return Err(OrchestratorError::Unreachable(node.to_string()));
        }
        self.nodes
            .get(node)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {}", node)))
    }
}

/// Cluster held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a running workload with sensible defaults for the remaining fields
    pub fn workload(
        id: &str,
        kind: WorkloadKind,
        node: &str,
        cpu_percent: f64,
        memory_bytes: u64,
    ) -> WorkloadInfo {
        WorkloadInfo {
            id: id.to_string(),
            name: format!("{}-{}", kind, id),
            kind,
            node: node.to_string(),
            running: true,
            cpu_percent,
            memory_bytes,
            memory_max_bytes: memory_bytes.saturating_mul(2),
            disk_bytes: 8 << 30,
        }
    }

    pub async fn add_node(&self, id: &str, cpu_percent: f64, memory_used: u64, memory_total: u64) {
        let mut state = self.state.write().await;
        state.nodes.insert(
            id.to_string(),
            SimNode {
                online: true,
                cpu_percent,
                memory: MemoryUsage {
                    used: memory_used,
                    total: memory_total,
                },
            },
        );
    }

    pub async fn set_node_load(&self, id: &str, cpu_percent: f64, memory_used: u64) {
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(id) {
            node.cpu_percent = cpu_percent;
            node.memory.used = memory_used;
        }
    }

    pub async fn set_node_online(&self, id: &str, online: bool) {
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(id) {
            node.online = online;
        }
    }

    pub async fn add_workload(&self, workload: WorkloadInfo) {
        let mut state = self.state.write().await;
        state.workloads.insert(workload.id.clone(), workload);
    }

    pub async fn set_node_history(&self, node: &str, history: Vec<HistoryPoint>) {
        let mut state = self.state.write().await;
        state.node_history.insert(node.to_string(), history);
    }

    pub async fn set_workload_history(&self, workload_id: &str, history: Vec<HistoryPoint>) {
        let mut state = self.state.write().await;
        state.workload_history.insert(workload_id.to_string(), history);
    }

    pub async fn set_storage(&self, node: &str, storage: Vec<StorageUsage>) {
        let mut state = self.state.write().await;
        state.storage.insert(node.to_string(), storage);
    }

    pub async fn set_interfaces(&self, node: &str, interfaces: Vec<InterfaceUsage>) {
        let mut state = self.state.write().await;
        state.interfaces.insert(node.to_string(), interfaces);
    }

    /// Make every call addressed to this node fail as unreachable
    pub async fn fail_node(&self, node: &str) {
        let mut state = self.state.write().await;
        state.failing_nodes.insert(node.to_string());
    }

    pub async fn recover_node(&self, node: &str) {
        let mut state = self.state.write().await;
        state.failing_nodes.remove(node);
    }

    /// Make node listing fail, which every tick depends on
    pub async fn fail_listing(&self) {
        self.state.write().await.listing_fails = true;
    }

    pub async fn recover_listing(&self) {
        self.state.write().await.listing_fails = false;
    }

    /// Make storage queries fail on every node
    pub async fn fail_storage(&self) {
        self.state.write().await.storage_fails = true;
    }

    /// Delay every network query by `delay`
    pub async fn stall_network(&self, delay: Duration) {
        self.state.write().await.network_delay = Some(delay);
    }

    /// Refuse any migration of this workload with `success = false`
    pub async fn refuse_migrations_for(&self, workload_id: &str) {
        let mut state = self.state.write().await;
        state.refused_migrations.insert(workload_id.to_string());
    }

    /// Migrate calls received so far, including refused ones
    pub async fn migrations(&self) -> Vec<MigrationCall> {
        self.state.read().await.migrations.clone()
    }

    pub async fn workload_node(&self, workload_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state.workloads.get(workload_id).map(|w| w.node.clone())
    }
}

#[async_trait]
impl OrchestrationApi for InMemoryCluster {
    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        let state = self.state.read().await;
        if state.listing_fails {
            return Err(OrchestratorError::Unreachable("cluster".to_string()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|(id, node)| NodeInfo {
                id: id.clone(),
                online: node.online,
                cpu_percent: node.cpu_percent,
                memory: node.memory,
            })
            .collect())
    }

    async fn node_status(&self, node: &str) -> OrchestratorResult<NodeStatus> {
        let state = self.state.read().await;
        let sim = state.reachable(node)?;
        Ok(NodeStatus {
            cpu_percent: sim.cpu_percent,
            memory: sim.memory,
        })
    }

    async fn list_workloads(
        &self,
        node: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<Vec<WorkloadInfo>> {
        let state = self.state.read().await;
        state.reachable(node)?;
        Ok(state
            .workloads
            .values()
            .filter(|w| w.node == node && w.kind == kind)
            .cloned()
            .collect())
    }

    async fn workload_status(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<WorkloadStatus> {
        let state = self.state.read().await;
        state.reachable(node)?;
        state
            .workloads
            .get(id)
            .filter(|w| w.node == node && w.kind == kind)
            .map(|w| WorkloadStatus {
                running: w.running,
                cpu_percent: w.cpu_percent,
                memory_bytes: w.memory_bytes,
                disk_bytes: w.disk_bytes,
            })
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} {}", kind, id)))
    }

    async fn migrate(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
        target: &str,
        mode: MigrationMode,
    ) -> OrchestratorResult<ApiResponse<String>> {
        let mut state = self.state.write().await;
        state.reachable(node)?;
        state.migrations.push(MigrationCall {
            workload_id: id.to_string(),
            kind,
            source: node.to_string(),
            target: target.to_string(),
            mode,
        });

        if state.refused_migrations.contains(id) {
            return Ok(ApiResponse::failed(format!("migration of {} refused", id)));
        }
        if state.reachable(target).is_err() {
            return Ok(ApiResponse::failed(format!("target {} unavailable", target)));
        }

        let Some(workload) = state.workloads.get_mut(id).filter(|w| w.node == node) else {
            return Ok(ApiResponse::failed(format!("{} {} not on {}", kind, id, node)));
        };
        workload.node = target.to_string();
        let (cpu, memory) = (workload.cpu_percent, workload.memory_bytes);

        if let Some(source) = state.nodes.get_mut(node) {
            source.cpu_percent = (source.cpu_percent - cpu).max(0.0);
            source.memory.used = source.memory.used.saturating_sub(memory);
        }
        if let Some(dest) = state.nodes.get_mut(target) {
            dest.cpu_percent += cpu;
            dest.memory.used = dest.memory.used.saturating_add(memory);
        }

        Ok(ApiResponse::ok(
            format!("{} {} migrated to {}", kind, id, target),
            Some(format!("task:{}:{}", id, target)),
        ))
    }

    async fn node_history(
        &self,
        node: &str,
        _timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>> {
        let state = self.state.read().await;
        state.reachable(node)?;
        Ok(state.node_history.get(node).cloned().unwrap_or_default())
    }

    async fn workload_history(
        &self,
        node: &str,
        id: &str,
        _kind: WorkloadKind,
        _timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>> {
        let state = self.state.read().await;
        state.reachable(node)?;
        Ok(state.workload_history.get(id).cloned().unwrap_or_default())
    }

    async fn storage_usage(&self, node: &str) -> OrchestratorResult<Vec<StorageUsage>> {
        let state = self.state.read().await;
        state.reachable(node)?;
        if state.storage_fails {
            return Err(OrchestratorError::Rejected(format!(
                "storage query on {} failed",
                node
            )));
        }
        Ok(state.storage.get(node).cloned().unwrap_or_default())
    }

    async fn network_usage(&self, node: &str) -> OrchestratorResult<Vec<InterfaceUsage>> {
        let delay = self.state.read().await.network_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.read().await;
        state.reachable(node)?;
        Ok(state.interfaces.get(node).cloned().unwrap_or_default())
    }
}
