//! Telemetry collection loop
//!
//! Periodically gathers node, workload, storage and network metrics from
//! the orchestration API. The four families are fetched concurrently under
//! a small semaphore; a failing family is logged and left out of that tick.

use super::{Alert, AlertCallback, AlertThresholds, Alerter, MetricsBuffer, MetricsSink};
use crate::error::{CollectorError, OrchestratorError};
use crate::health::{components, HealthRegistry};
use crate::models::{CollectorFamily, MetricKind, MetricSample, MetricScope};
use crate::observability::BalancerMetrics;
use crate::orchestrator::{eligible_nodes, node_workloads, OrchestrationApi};
use crate::worker::{BackgroundWorker, DEFAULT_STOP_TIMEOUT};
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the telemetry collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Collection interval used when started without an explicit one
    pub interval: Duration,
    /// Number of samples kept in the ring buffer
    pub buffer_capacity: usize,
    /// Maximum concurrent family fetches
    pub max_concurrency: usize,
    /// Timeout applied to each family fetch
    pub fetch_timeout: Duration,
    /// Nodes never polled
    pub exclude_nodes: HashSet<String>,
    /// Time allowed for the loop to exit on stop
    pub stop_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            buffer_capacity: super::DEFAULT_BUFFER_CAPACITY,
            max_concurrency: 4,
            fetch_timeout: Duration::from_secs(10),
            exclude_nodes: HashSet::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Outcome of a single collection tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub timestamp: i64,
    pub samples: usize,
    pub failed_families: Vec<CollectorFamily>,
    pub alerts: Vec<Alert>,
}

struct CollectorInner {
    api: Arc<dyn OrchestrationApi>,
    config: CollectorConfig,
    buffer: Arc<RwLock<MetricsBuffer>>,
    permits: Semaphore,
    alerter: Alerter,
    sink: Option<Arc<dyn MetricsSink>>,
    metrics: Option<BalancerMetrics>,
    health: Option<HealthRegistry>,
}

/// Periodic telemetry collector owning the sample buffer
pub struct TelemetryCollector {
    inner: Arc<CollectorInner>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl TelemetryCollector {
    /// Create a collector with default alert thresholds and no sink
    pub fn new(api: Arc<dyn OrchestrationApi>, config: CollectorConfig) -> Self {
        Self::from_parts(api, config, Alerter::default(), None, None, None)
    }

    fn from_parts(
        api: Arc<dyn OrchestrationApi>,
        config: CollectorConfig,
        alerter: Alerter,
        sink: Option<Arc<dyn MetricsSink>>,
        metrics: Option<BalancerMetrics>,
        health: Option<HealthRegistry>,
    ) -> Self {
        let inner = CollectorInner {
            api,
            buffer: Arc::new(RwLock::new(MetricsBuffer::new(config.buffer_capacity))),
            permits: Semaphore::new(config.max_concurrency.max(1)),
            config,
            alerter,
            sink,
            metrics,
            health,
        };
        Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }

    /// Forward every tick's samples to `sink`
    ///
    /// Must be called before the collector is started; a running collector
    /// keeps the sink it was started with.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.sink = Some(sink),
            None => warn!("Collector already started, sink not attached"),
        }
        self
    }

    /// Start periodic collection
    pub async fn start(&self, interval: Option<Duration>) -> Result<(), CollectorError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| w.is_active()) {
            return Err(CollectorError::AlreadyRunning);
        }

        let period = interval.unwrap_or(self.inner.config.interval);
        let inner = self.inner.clone();
        *worker = Some(BackgroundWorker::spawn("telemetry-collector", move |shutdown| {
            run(inner, period, shutdown)
        }));
        Ok(())
    }

    /// Stop periodic collection, waiting for the current tick to finish
    pub async fn stop(&self) -> Result<(), CollectorError> {
        let worker = self.worker.lock().await.take();
        match worker {
            Some(w) if w.is_active() => {
                w.shutdown(self.inner.config.stop_timeout).await;
                Ok(())
            }
            _ => Err(CollectorError::NotRunning),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| w.is_active())
    }

    /// Run one collection tick immediately
    pub async fn collect_once(&self) -> TickReport {
        self.inner.collect_once().await
    }

    /// Copy of the newest `count` buffered samples (all when `None`)
    pub async fn get_buffered(&self, count: Option<usize>) -> Vec<MetricSample> {
        self.inner.buffer.read().await.recent(count)
    }

    /// Shared read handle to the buffer for history lookups
    pub fn buffer(&self) -> Arc<RwLock<MetricsBuffer>> {
        self.inner.buffer.clone()
    }

    /// Register a callback invoked whenever a metric crosses its threshold
    pub fn register_alert_callback<F>(&self, callback: F)
    where
        F: Fn(super::AlertLevel, &str, &super::AlertContext) + Send + Sync + 'static,
    {
        let callback: AlertCallback = Arc::new(callback);
        self.inner.alerter.register_callback(callback);
    }
}

async fn run(inner: Arc<CollectorInner>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    info!(
        interval_secs = period.as_secs(),
        "Starting telemetry collection loop"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = inner.collect_once().await;
                debug!(
                    samples = report.samples,
                    failed = report.failed_families.len(),
                    alerts = report.alerts.len(),
                    "Collection cycle complete"
                );
            }
            _ = shutdown.recv() => {
                info!("Shutting down telemetry collection loop");
                break;
            }
        }
    }
}

impl CollectorInner {
    async fn collect_once(&self) -> TickReport {
        let start = Instant::now();
        let timestamp = chrono::Utc::now().timestamp();

        let (workloads, nodes, storage, network) = tokio::join!(
            self.fetch(CollectorFamily::Workloads, timestamp),
            self.fetch(CollectorFamily::Nodes, timestamp),
            self.fetch(CollectorFamily::Storage, timestamp),
            self.fetch(CollectorFamily::Network, timestamp),
        );

        let mut samples = Vec::new();
        let mut failed_families = Vec::new();
        for (family, result) in CollectorFamily::ALL
            .into_iter()
            .zip([workloads, nodes, storage, network])
        {
            match result {
                Ok(family_samples) => samples.extend(family_samples),
                Err(e) => {
                    warn!(family = family.as_str(), error = %e, "Metric family collection failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_collection_errors(family.as_str());
                    }
                    failed_families.push(family);
                }
            }
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.forward(&samples).await {
                warn!(error = %e, "Failed to forward samples to metrics sink");
            }
        }

        let alerts = self.alerter.evaluate(&samples);
        if let Some(metrics) = &self.metrics {
            for alert in &alerts {
                metrics.inc_alerts(alert.level);
            }
        }

        let sample_count = samples.len();
        let buffered = {
            let mut buffer = self.buffer.write().await;
            buffer.push_batch(samples);
            buffer.len()
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_collection_latency(start.elapsed().as_secs_f64());
            metrics.set_buffered_samples(buffered);
        }
        self.report_health(&failed_families).await;

        TickReport {
            timestamp,
            samples: sample_count,
            failed_families,
            alerts,
        }
    }

    async fn report_health(&self, failed: &[CollectorFamily]) {
        let Some(health) = &self.health else {
            return;
        };
        if failed.is_empty() {
            health.set_healthy(components::COLLECTOR).await;
        } else if failed.len() == CollectorFamily::ALL.len() {
            health
                .set_unhealthy(components::COLLECTOR, "all metric families failed")
                .await;
        } else {
            let names: Vec<_> = failed.iter().map(|f| f.as_str()).collect();
            health
                .set_degraded(
                    components::COLLECTOR,
                    format!("failed families: {}", names.join(", ")),
                )
                .await;
        }
    }

    async fn fetch(&self, family: CollectorFamily, timestamp: i64) -> Result<Vec<MetricSample>> {
        let _permit = self.permits.acquire().await?;
        tokio::time::timeout(self.config.fetch_timeout, self.gather(family, timestamp))
            .await
            .map_err(|_| anyhow!("{} fetch timed out", family.as_str()))?
            .map_err(anyhow::Error::from)
    }

    /// Gather one family across all eligible nodes
    ///
    /// Nodes that fail are skipped; the family fails only when no node
    /// answered.
    async fn gather(
        &self,
        family: CollectorFamily,
        timestamp: i64,
    ) -> Result<Vec<MetricSample>, OrchestratorError> {
        let api = self.api.as_ref();
        let nodes = eligible_nodes(api, &self.config.exclude_nodes).await?;

        let mut samples = Vec::new();
        let mut last_error = None;
        let mut answered = 0;
        for node in &nodes {
            let id = node.id.as_str();
            let sample = |kind, scope, scope_id: &str, value| MetricSample {
                kind,
                scope,
                scope_id: scope_id.to_string(),
                node: id.to_string(),
                value,
                timestamp,
                collector_source: family,
            };

            let result = match family {
                CollectorFamily::Nodes => {
                    let scope = MetricScope::Node;
                    samples.push(sample(MetricKind::Cpu, scope, id, node.cpu_percent));
                    samples.push(sample(MetricKind::Memory, scope, id, node.memory.percent()));
                    Ok(())
                }
                CollectorFamily::Workloads => node_workloads(api, id).await.map(|workloads| {
                    for w in workloads.iter().filter(|w| w.running) {
                        let scope = MetricScope::Workload(w.kind);
                        samples.push(sample(MetricKind::Cpu, scope, &w.id, w.cpu_percent));
                        samples.push(sample(MetricKind::Memory, scope, &w.id, w.memory_percent()));
                    }
                }),
                CollectorFamily::Storage => api.storage_usage(id).await.map(|pools| {
                    let scope = MetricScope::Storage;
                    for pool in pools {
                        let (used, total) = (pool.used as f64, pool.total as f64);
                        samples.push(sample(MetricKind::StorageUsed, scope, &pool.id, used));
                        samples.push(sample(MetricKind::StorageTotal, scope, &pool.id, total));
                    }
                }),
                CollectorFamily::Network => api.network_usage(id).await.map(|interfaces| {
                    let scope = MetricScope::Interface;
                    for iface in interfaces {
                        let name = iface.name.as_str();
                        samples.push(sample(MetricKind::NetIn, scope, name, iface.in_bytes));
                        samples.push(sample(MetricKind::NetOut, scope, name, iface.out_bytes));
                    }
                }),
            };

            match result {
                Ok(()) => answered += 1,
                Err(e) => {
                    debug!(node = id, family = family.as_str(), error = %e, "Skipping node");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if answered == 0 => Err(e),
            _ => Ok(samples),
        }
    }
}

/// Builder for the telemetry collector
pub struct TelemetryCollectorBuilder {
    api: Option<Arc<dyn OrchestrationApi>>,
    config: CollectorConfig,
    thresholds: AlertThresholds,
    sink: Option<Arc<dyn MetricsSink>>,
    metrics: Option<BalancerMetrics>,
    health: Option<HealthRegistry>,
}

impl TelemetryCollectorBuilder {
    pub fn new() -> Self {
        Self {
            api: None,
            config: CollectorConfig::default(),
            thresholds: AlertThresholds::default(),
            sink: None,
            metrics: None,
            health: None,
        }
    }

    pub fn api(mut self, api: Arc<dyn OrchestrationApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: BalancerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<TelemetryCollector> {
        let api = self
            .api
            .ok_or_else(|| anyhow!("Orchestration API is required"))?;

        Ok(TelemetryCollector::from_parts(
            api,
            self.config,
            Alerter::new(self.thresholds),
            self.sink,
            self.metrics,
            self.health,
        ))
    }
}

impl Default for TelemetryCollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InterfaceUsage, StorageUsage, WorkloadKind};
    use crate::orchestrator::InMemoryCluster;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn cluster() -> Arc<InMemoryCluster> {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("pve1", 92.0, 4 << 30, 8 << 30).await;
        cluster.add_node("pve2", 10.0, 1 << 30, 8 << 30).await;
        cluster
            .add_workload(InMemoryCluster::workload("101", WorkloadKind::Vm, "pve1", 30.0, 1 << 30))
            .await;
        cluster
            .add_workload(InMemoryCluster::workload(
                "201",
                WorkloadKind::Container,
                "pve2",
                5.0,
                256 << 20,
            ))
            .await;
        cluster
            .set_storage(
                "pve1",
                vec![StorageUsage {
                    id: "local".to_string(),
                    used: 50,
                    total: 100,
                }],
            )
            .await;
        cluster
            .set_interfaces(
                "pve1",
                vec![InterfaceUsage {
                    name: "vmbr0".to_string(),
                    in_bytes: 1000.0,
                    out_bytes: 500.0,
                }],
            )
            .await;
        cluster
    }

    #[tokio::test]
    async fn test_collect_once_gathers_all_families() {
        let cluster = cluster().await;
        let collector = TelemetryCollector::new(cluster, CollectorConfig::default());

        let report = collector.collect_once().await;
        assert!(report.failed_families.is_empty());
        // 2 nodes x 2 + 2 workloads x 2 + 1 pool x 2 + 1 interface x 2
        assert_eq!(report.samples, 12);

        let buffered = collector.get_buffered(None).await;
        assert_eq!(buffered.len(), 12);
        assert!(buffered.iter().all(|s| s.timestamp == report.timestamp));
        assert!(buffered.iter().any(|s| {
            s.collector_source == CollectorFamily::Storage && s.kind == MetricKind::StorageUsed
        }));
    }

    #[tokio::test]
    async fn test_failing_node_is_skipped_not_fatal() {
        let cluster = cluster().await;
        cluster.fail_node("pve1").await;
        let collector = TelemetryCollector::new(cluster, CollectorConfig::default());

        let report = collector.collect_once().await;
        assert!(report.failed_families.is_empty());
        let buffered = collector.get_buffered(None).await;
        assert!(buffered
            .iter()
            .filter(|s| s.scope != MetricScope::Node)
            .all(|s| s.node == "pve2"));
    }

    #[tokio::test]
    async fn test_failing_family_is_excluded() {
        let cluster = cluster().await;
        cluster.fail_storage().await;
        let health = HealthRegistry::new();
        let collector = TelemetryCollectorBuilder::new()
            .api(cluster)
            .health(health.clone())
            .build()
            .unwrap();

        let report = collector.collect_once().await;
        assert_eq!(report.failed_families, vec![CollectorFamily::Storage]);
        // 2 nodes x 2 + 2 workloads x 2 + 1 interface x 2
        assert_eq!(report.samples, 10);

        let buffered = collector.get_buffered(None).await;
        assert_eq!(buffered.len(), 10);
        assert!(buffered
            .iter()
            .all(|s| s.collector_source != CollectorFamily::Storage));
        assert!(buffered
            .iter()
            .any(|s| s.collector_source == CollectorFamily::Network));

        let status = health.health().await.components[components::COLLECTOR].status;
        assert_eq!(status, crate::health::ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_stalled_family_times_out() {
        let cluster = cluster().await;
        cluster.stall_network(Duration::from_secs(30)).await;
        let config = CollectorConfig {
            fetch_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let collector = TelemetryCollector::new(cluster, config);

        let start = Instant::now();
        let report = collector.collect_once().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.failed_families, vec![CollectorFamily::Network]);
        assert_eq!(report.samples, 10);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_every_family() {
        let cluster = cluster().await;
        cluster.fail_listing().await;
        let health = HealthRegistry::new();
        let collector = TelemetryCollectorBuilder::new()
            .api(cluster.clone())
            .health(health.clone())
            .build()
            .unwrap();

        let report = collector.collect_once().await;
        assert_eq!(report.failed_families.len(), CollectorFamily::ALL.len());
        assert_eq!(report.samples, 0);
        let status = health.health().await.components[components::COLLECTOR].status;
        assert_eq!(status, crate::health::ComponentStatus::Unhealthy);

        cluster.recover_listing().await;
        let report = collector.collect_once().await;
        assert!(report.failed_families.is_empty());
        assert_eq!(collector.get_buffered(None).await.len(), 12);
    }

    #[tokio::test]
    async fn test_excluded_nodes_are_not_polled() {
        let cluster = cluster().await;
        let config = CollectorConfig {
            exclude_nodes: ["pve1".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let collector = TelemetryCollector::new(cluster, config);

        collector.collect_once().await;
        let buffered = collector.get_buffered(None).await;
        assert!(!buffered.is_empty());
        assert!(buffered.iter().all(|s| s.node == "pve2"));
    }

    #[tokio::test]
    async fn test_alert_callback_fires_on_threshold() {
        let cluster = cluster().await;
        let collector = TelemetryCollector::new(cluster, CollectorConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        collector.register_alert_callback(move |_, _, ctx| {
            assert_eq!(ctx.node, "pve1");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let report = collector.collect_once().await;
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_buffer_respects_capacity() {
        let cluster = cluster().await;
        let config = CollectorConfig {
            buffer_capacity: 5,
            ..Default::default()
        };
        let collector = TelemetryCollector::new(cluster, config);

        collector.collect_once().await;
        collector.collect_once().await;
        assert_eq!(collector.get_buffered(None).await.len(), 5);
        assert_eq!(collector.get_buffered(Some(2)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_twice_fails() {
        let cluster = cluster().await;
        let collector = TelemetryCollector::new(cluster, CollectorConfig::default());

        collector
            .start(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(collector.is_running().await);
        assert_eq!(
            collector.start(None).await,
            Err(CollectorError::AlreadyRunning)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!collector.get_buffered(None).await.is_empty());

        collector.stop().await.unwrap();
        assert!(!collector.is_running().await);
        assert_eq!(collector.stop().await, Err(CollectorError::NotRunning));
    }

    struct CountingSink(AtomicUsize);

    #[async_trait::async_trait]
    impl MetricsSink for CountingSink {
        async fn forward(&self, samples: &[MetricSample]) -> Result<()> {
            self.0.fetch_add(samples.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_receives_tick_samples() {
        let cluster = cluster().await;
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let collector =
            TelemetryCollector::new(cluster, CollectorConfig::default()).with_sink(sink.clone());

        let report = collector.collect_once().await;
        assert_eq!(sink.0.load(Ordering::SeqCst), report.samples);
    }

    #[tokio::test]
    async fn test_builder_requires_api() {
        assert!(TelemetryCollectorBuilder::new().build().is_err());

        let cluster = cluster().await;
        let collector = TelemetryCollectorBuilder::new()
            .api(cluster)
            .interval(Duration::from_secs(5))
            .build();
        assert!(collector.is_ok());
    }
}
