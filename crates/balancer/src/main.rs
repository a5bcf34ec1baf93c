//! Cluster Balancer - predictive workload balancing daemon
//!
//! Polls the cluster orchestration API for telemetry, forecasts node
//! load and migrates workloads off hot nodes, or consolidates idle ones.

use anyhow::Result;
use balancer_lib::{
    analyzer::BufferedHistory,
    collector::{PrometheusSink, TelemetryCollectorBuilder},
    engine::DecisionEngine,
    health::{components, HealthRegistry},
    observability::{BalancerMetrics, StructuredLogger},
    orchestrator::{OrchestrationApi, RestOrchestrator},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const BALANCER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cluster-balancer");

    let config = config::DaemonConfig::load()?;
    info!(
        cluster = %config.cluster_name,
        orchestrator = %config.orchestrator.url,
        enabled = config.balancer.enabled,
        auto_approve = config.balancer.auto_approve,
        "Balancer configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::ORCHESTRATOR).await;

    let metrics = BalancerMetrics::new();

    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(BALANCER_VERSION);

    let orchestrator: Arc<dyn OrchestrationApi> =
        Arc::new(RestOrchestrator::new(config.orchestrator.rest_config())?);

    let collector = TelemetryCollectorBuilder::new()
        .api(orchestrator.clone())
        .config(config.collector_config())
        .alert_thresholds(config.alerts.clone())
        .sink(Arc::new(PrometheusSink::new(metrics.clone())))
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .build()?;
    let alert_logger = logger.clone();
    collector.register_alert_callback(move |level, message, context| {
        alert_logger.log_alert(level, message, context);
    });
    collector.start(None).await?;

    let mut engine = DecisionEngine::new(orchestrator.clone(), config.balancer.clone())
        .with_metrics(metrics.clone())
        .with_health(health_registry.clone())
        .with_logger(logger.clone());
    if config.history_source == config::HistorySourceKind::Telemetry {
        engine = engine.with_history_source(Arc::new(BufferedHistory::new(collector.buffer())));
    }
    let engine = Arc::new(engine);
    if config.balancer.enabled {
        engine.start().await?;
    }

    let collector = Arc::new(collector);
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        orchestrator,
        engine.clone(),
        collector.clone(),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    if let Err(e) = engine.stop().await {
        warn!(error = %e, "Decision engine was not running at shutdown");
    }
    if let Err(e) = collector.stop().await {
        warn!(error = %e, "Collector was not running at shutdown");
    }
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
