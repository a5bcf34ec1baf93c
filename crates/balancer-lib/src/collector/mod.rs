//! Cluster telemetry collection
//!
//! Polls the orchestration API for node, workload, storage and network
//! usage, keeps the most recent samples in a bounded buffer, raises
//! threshold alerts and forwards every tick to an optional metrics sink.

mod alerter;
mod buffer;
mod r#loop;
mod sink;

pub use alerter::{Alert, AlertCallback, AlertContext, AlertLevel, AlertThresholds, Alerter};
pub use buffer::{MetricsBuffer, DEFAULT_BUFFER_CAPACITY};
pub use r#loop::{CollectorConfig, TelemetryCollector, TelemetryCollectorBuilder, TickReport};
pub use sink::{MetricsSink, PrometheusSink};
