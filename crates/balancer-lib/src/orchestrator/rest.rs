//! REST client for a Proxmox-style cluster API
//!
//! Every response is wrapped in a `{"data": ...}` envelope. CPU values are
//! reported as fractions and converted to percent here so the rest of the
//! crate only ever sees percentages.

use super::{async_trait, OrchestrationApi, OrchestratorResult, Timeframe};
use crate::error::OrchestratorError;
use crate::models::{
    ApiResponse, HistoryPoint, InterfaceUsage, MemoryUsage, MigrationMode, NodeInfo,
    NodeStatus, StorageUsage, WorkloadInfo, WorkloadKind, WorkloadStatus,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Configuration for the REST client
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL, e.g. "https://cluster.local:8006/"
    pub base_url: String,
    /// API token in `USER@REALM!TOKENID=SECRET` form
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Verify the server certificate
    pub verify_tls: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8006/".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            verify_tls: true,
        }
    }
}

/// Orchestration API backed by HTTP calls
pub struct RestOrchestrator {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl RestOrchestrator {
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> OrchestratorResult<Url> {
        self.base_url
            .join(&format!("api2/json/{}", path.trim_start_matches('/')))
            .map_err(|e| OrchestratorError::Decode(format!("invalid path {}: {}", path, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("PVEAPIToken={}", token)),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> OrchestratorResult<T> {
        let url = self.url(path)?;
        debug!(url = %url, "GET");

        let response = self
            .authorize(self.client.get(url.clone()).query(query))
            .send()
            .await
            .map_err(|e| map_transport_error(e, &url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, path, body));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    fn workload_path(node: &str, id: &str, kind: WorkloadKind) -> String {
        format!("nodes/{}/{}/{}", node, kind.api_segment(), id)
    }
}

#[async_trait]
impl OrchestrationApi for RestOrchestrator {
    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        let raw: Vec<RawNode> = self.get("nodes", &[]).await?;
        Ok(raw.into_iter().map(NodeInfo::from).collect())
    }

    async fn node_status(&self, node: &str) -> OrchestratorResult<NodeStatus> {
        let raw: RawNodeStatus = self.get(&format!("nodes/{}/status", node), &[]).await?;
        Ok(raw.into())
    }

    async fn list_workloads(
        &self,
        node: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<Vec<WorkloadInfo>> {
        let raw: Vec<RawWorkload> = self
            .get(&format!("nodes/{}/{}", node, kind.api_segment()), &[])
            .await?;
        Ok(raw
            .into_iter()
            .map(|w| w.into_workload(node, kind))
            .collect())
    }

    async fn workload_status(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
    ) -> OrchestratorResult<WorkloadStatus> {
        let path = format!("{}/status/current", Self::workload_path(node, id, kind));
        let raw: RawWorkload = self.get(&path, &[]).await?;
        Ok(raw.into_workload(node, kind).into_status())
    }

    async fn migrate(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
        target: &str,
        mode: MigrationMode,
    ) -> OrchestratorResult<ApiResponse<String>> {
        let url = self.url(&format!("{}/migrate", Self::workload_path(node, id, kind)))?;
        let mode_flag = match mode {
            MigrationMode::Online => "online",
            MigrationMode::Restart => "restart",
        };
        let form = [("target", target), (mode_flag, "1")];

        let response = self
            .authorize(self.client.post(url.clone()).form(&form))
            .send()
            .await
            .map_err(|e| map_transport_error(e, &url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, workload = %id, target = %target, "Migration request refused");
            return Ok(ApiResponse::failed(format!("{}: {}", status, body.trim())));
        }

        let envelope: Envelope<Option<String>> = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Decode(e.to_string()))?;
        Ok(ApiResponse::ok(
            format!("migration of {} {} to {} started", kind, id, target),
            envelope.data,
        ))
    }

    async fn node_history(
        &self,
        node: &str,
        timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>> {
        let raw: Vec<RawRrdPoint> = self
            .get(
                &format!("nodes/{}/rrddata", node),
                &[("timeframe", timeframe.as_str())],
            )
            .await?;
        Ok(raw.into_iter().map(HistoryPoint::from).collect())
    }

    async fn workload_history(
        &self,
        node: &str,
        id: &str,
        kind: WorkloadKind,
        timeframe: Timeframe,
    ) -> OrchestratorResult<Vec<HistoryPoint>> {
        let path = format!("{}/rrddata", Self::workload_path(node, id, kind));
        let raw: Vec<RawRrdPoint> = self
            .get(&path, &[("timeframe", timeframe.as_str())])
            .await?;
        Ok(raw.into_iter().map(HistoryPoint::from).collect())
    }

    async fn storage_usage(&self, node: &str) -> OrchestratorResult<Vec<StorageUsage>> {
        let raw: Vec<RawStorage> = self.get(&format!("nodes/{}/storage", node), &[]).await?;
        Ok(raw
            .into_iter()
            .filter(|s| s.active.unwrap_or(1) != 0)
            .map(StorageUsage::from)
            .collect())
    }

    async fn network_usage(&self, node: &str) -> OrchestratorResult<Vec<InterfaceUsage>> {
        // Per-interface counters are not exposed; the newest RRD point carries node totals
        let history = self.node_history(node, Timeframe::Hour).await?;
        Ok(latest_traffic(&history).into_iter().collect())
    }
}

fn map_transport_error(error: reqwest::Error, url: &Url) -> OrchestratorError {
    if error.is_timeout() {
        OrchestratorError::Timeout
    } else if error.is_connect() {
        OrchestratorError::Unreachable(url.host_str().unwrap_or_default().to_string())
    } else {
        OrchestratorError::Http(error)
    }
}

fn map_status(status: StatusCode, path: &str, body: String) -> OrchestratorError {
    match status {
        StatusCode::NOT_FOUND => OrchestratorError::NotFound(path.to_string()),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            OrchestratorError::Unreachable(path.to_string())
        }
        _ => OrchestratorError::Rejected(format!("{}: {}", status, body.trim())),
    }
}

fn latest_traffic(history: &[HistoryPoint]) -> Option<InterfaceUsage> {
    history
        .iter()
        .rev()
        .find_map(|p| match (p.net_in, p.net_out) {
            (Some(in_bytes), Some(out_bytes)) => Some(InterfaceUsage {
                name: "total".to_string(),
                in_bytes,
                out_bytes,
            }),
            _ => None,
        })
}

fn percent(fraction: Option<f64>) -> f64 {
    fraction.unwrap_or(0.0) * 100.0
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    node: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
}

impl From<RawNode> for NodeInfo {
    fn from(raw: RawNode) -> Self {
        Self {
            online: raw.status.as_deref() == Some("online"),
            cpu_percent: percent(raw.cpu),
            memory: MemoryUsage {
                used: raw.mem.unwrap_or(0),
                total: raw.maxmem.unwrap_or(0),
            },
            id: raw.node,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMemory {
    used: u64,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct RawNodeStatus {
    cpu: f64,
    memory: RawMemory,
}

impl From<RawNodeStatus> for NodeStatus {
    fn from(raw: RawNodeStatus) -> Self {
        Self {
            cpu_percent: raw.cpu * 100.0,
            memory: MemoryUsage {
                used: raw.memory.used,
                total: raw.memory.total,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawWorkload {
    vmid: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    maxdisk: Option<u64>,
}

impl RawWorkload {
    fn into_workload(self, node: &str, kind: WorkloadKind) -> WorkloadInfo {
        let id = self.vmid.to_string();
        WorkloadInfo {
            name: self.name.unwrap_or_else(|| format!("{}-{}", kind, id)),
            id,
            kind,
            node: node.to_string(),
            running: self.status.as_deref() == Some("running"),
            cpu_percent: percent(self.cpu),
            memory_bytes: self.mem.unwrap_or(0),
            memory_max_bytes: self.maxmem.unwrap_or(0),
            disk_bytes: self.maxdisk.unwrap_or(0),
        }
    }
}

impl WorkloadInfo {
    fn into_status(self) -> WorkloadStatus {
        WorkloadStatus {
            running: self.running,
            cpu_percent: self.cpu_percent,
            memory_bytes: self.memory_bytes,
            disk_bytes: self.disk_bytes,
        }
    }
}

/// RRD point; nodes report `memused/memtotal`, guests `mem/maxmem`
#[derive(Debug, Deserialize)]
struct RawRrdPoint {
    time: i64,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<f64>,
    #[serde(default)]
    maxmem: Option<f64>,
    #[serde(default)]
    memused: Option<f64>,
    #[serde(default)]
    memtotal: Option<f64>,
    #[serde(default)]
    diskread: Option<f64>,
    #[serde(default)]
    diskwrite: Option<f64>,
    #[serde(default)]
    netin: Option<f64>,
    #[serde(default)]
    netout: Option<f64>,
}

impl From<RawRrdPoint> for HistoryPoint {
    fn from(raw: RawRrdPoint) -> Self {
        let memory_percent = match (raw.mem.or(raw.memused), raw.maxmem.or(raw.memtotal)) {
            (Some(used), Some(total)) if total > 0.0 => Some(used / total * 100.0),
            _ => None,
        };
        Self {
            timestamp: raw.time,
            cpu_percent: raw.cpu.map(|c| c * 100.0),
            memory_percent,
            disk_read: raw.diskread,
            disk_write: raw.diskwrite,
            net_in: raw.netin,
            net_out: raw.netout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    storage: String,
    #[serde(default)]
    used: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    active: Option<u8>,
}

impl From<RawStorage> for StorageUsage {
    fn from(raw: RawStorage) -> Self {
        Self {
            id: raw.storage,
            used: raw.used.unwrap_or(0),
            total: raw.total.unwrap_or(0),
        }
    }
}
