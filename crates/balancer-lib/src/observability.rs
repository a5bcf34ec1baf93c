//! Observability infrastructure for the balancer
//!
//! Provides:
//! - Prometheus metrics (tick and collection latency, migration outcomes,
//!   pending queue size, buffered samples, forwarded sample values)
//! - Structured JSON logging of balancing events with tracing

use crate::collector::{AlertContext, AlertLevel};
use crate::models::{MigrationRecord, MigrationStatus};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter_vec, register_int_gauge,
    GaugeVec, Histogram, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BalancerMetricsInner> = OnceLock::new();

struct BalancerMetricsInner {
    collection_latency_seconds: Histogram,
    tick_latency_seconds: Histogram,
    collection_errors: IntCounterVec,
    buffered_samples: IntGauge,
    sample_value: GaugeVec,
    ticks: IntCounterVec,
    migrations_planned: IntCounterVec,
    migrations_finished: IntCounterVec,
    pending_migrations: IntGauge,
    engine_running: IntGauge,
    alerts_fired: IntCounterVec,
}

impl BalancerMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "cluster_balancer_collection_latency_seconds",
                "Time spent gathering one telemetry tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            tick_latency_seconds: register_histogram!(
                "cluster_balancer_tick_latency_seconds",
                "Time spent in one decision engine tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            collection_errors: register_int_counter_vec!(
                "cluster_balancer_collection_errors_total",
                "Metric families that failed during a telemetry tick",
                &["family"]
            )
            .expect("Failed to register collection_errors"),

            buffered_samples: register_int_gauge!(
                "cluster_balancer_buffered_samples",
                "Number of samples held in the telemetry buffer"
            )
            .expect("Failed to register buffered_samples"),

            sample_value: register_gauge_vec!(
                "cluster_balancer_sample_value",
                "Latest collected value per metric and scope",
                &["kind", "scope", "id", "node"]
            )
            .expect("Failed to register sample_value"),

            ticks: register_int_counter_vec!(
                "cluster_balancer_ticks_total",
                "Decision engine ticks by outcome",
                &["outcome"]
            )
            .expect("Failed to register ticks"),

            migrations_planned: register_int_counter_vec!(
                "cluster_balancer_migrations_planned_total",
                "Migrations planned by reason",
                &["reason"]
            )
            .expect("Failed to register migrations_planned"),

            migrations_finished: register_int_counter_vec!(
                "cluster_balancer_migrations_finished_total",
                "Migrations that reached a terminal state",
                &["status"]
            )
            .expect("Failed to register migrations_finished"),

            pending_migrations: register_int_gauge!(
                "cluster_balancer_pending_migrations",
                "Migrations waiting for approval"
            )
            .expect("Failed to register pending_migrations"),

            engine_running: register_int_gauge!(
                "cluster_balancer_engine_running",
                "Whether the decision engine loop is running"
            )
            .expect("Failed to register engine_running"),

            alerts_fired: register_int_counter_vec!(
                "cluster_balancer_alerts_total",
                "Threshold alerts delivered to callbacks",
                &["level"]
            )
            .expect("Failed to register alerts_fired"),
        }
    }
}

/// Balancer metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct BalancerMetrics {
    _private: (),
}

impl Default for BalancerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BalancerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BalancerMetrics")
    }
}

impl BalancerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BalancerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BalancerMetricsInner {
        GLOBAL_METRICS.get_or_init(BalancerMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_collection_errors(&self, family: &str) {
        self.inner()
            .collection_errors
            .with_label_values(&[family])
            .inc();
    }

    pub fn set_buffered_samples(&self, count: usize) {
        self.inner().buffered_samples.set(count as i64);
    }

    pub fn set_sample(&self, kind: &str, scope: &str, id: &str, node: &str, value: f64) {
        self.inner()
            .sample_value
            .with_label_values(&[kind, scope, id, node])
            .set(value);
    }

    pub fn inc_ticks(&self, outcome: &str) {
        self.inner().ticks.with_label_values(&[outcome]).inc();
    }

    pub fn inc_migrations_planned(&self, reason: &str) {
        self.inner()
            .migrations_planned
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_migrations_finished(&self, status: MigrationStatus) {
        self.inner()
            .migrations_finished
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn set_pending_migrations(&self, count: usize) {
        self.inner().pending_migrations.set(count as i64);
    }

    pub fn set_engine_running(&self, running: bool) {
        self.inner().engine_running.set(i64::from(running));
    }

    pub fn inc_alerts(&self, level: AlertLevel) {
        self.inner()
            .alerts_fired
            .with_label_values(&[&level.to_string()])
            .inc();
    }
}

/// Structured logger for balancing events
///
/// Keeps the `event` field consistent so log pipelines can route on it.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "balancer_started",
            cluster = %self.cluster,
            version = %version,
            "Cluster balancer started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "balancer_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Cluster balancer shutting down"
        );
    }

    pub fn log_migration_planned(&self, record: &MigrationRecord, auto_approve: bool) {
        info!(
            event = "migration_planned",
            cluster = %self.cluster,
            migration_id = %record.id,
            workload_id = %record.workload_id,
            workload_kind = %record.workload_kind,
            source_node = %record.source_node,
            target_node = %record.target_node,
            reason = %record.reason,
            auto_approve = auto_approve,
            "Planned workload migration"
        );
    }

    pub fn log_migration_completed(&self, record: &MigrationRecord) {
        match record.status {
            MigrationStatus::Success => info!(
                event = "migration_completed",
                cluster = %self.cluster,
                migration_id = %record.id,
                workload_id = %record.workload_id,
                source_node = %record.source_node,
                target_node = %record.target_node,
                result = ?record.result,
                "Workload migrated"
            ),
            _ => warn!(
                event = "migration_completed",
                cluster = %self.cluster,
                migration_id = %record.id,
                workload_id = %record.workload_id,
                source_node = %record.source_node,
                target_node = %record.target_node,
                status = %record.status,
                error = ?record.error,
                "Workload migration failed"
            ),
        }
    }

    pub fn log_migration_rejected(&self, record: &MigrationRecord) {
        info!(
            event = "migration_rejected",
            cluster = %self.cluster,
            migration_id = %record.id,
            workload_id = %record.workload_id,
            "Migration rejected by operator"
        );
    }

    pub fn log_alert(&self, level: AlertLevel, message: &str, context: &AlertContext) {
        match level {
            AlertLevel::Critical => warn!(
                event = "threshold_alert",
                cluster = %self.cluster,
                level = %level,
                kind = %context.kind,
                scope_id = %context.scope_id,
                node = %context.node,
                value = context.value,
                threshold = context.threshold,
                "{}", message
            ),
            AlertLevel::Warning => info!(
                event = "threshold_alert",
                cluster = %self.cluster,
                level = %level,
                kind = %context.kind,
                scope_id = %context.scope_id,
                node = %context.node,
                value = context.value,
                threshold = context.threshold,
                "{}", message
            ),
        }
    }
}
