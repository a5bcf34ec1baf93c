//! HTTP API for health checks, Prometheus metrics and operator control

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use balancer_lib::analyzer::TrendAnalyzer;
use balancer_lib::collector::TelemetryCollector;
use balancer_lib::engine::{ConfigUpdate, DecisionEngine, TickOutcome, MAX_PREDICTION_HORIZON};
use balancer_lib::forecaster::Forecaster;
use balancer_lib::health::{ComponentStatus, HealthRegistry};
use balancer_lib::orchestrator::OrchestrationApi;
use balancer_lib::{AnalysisError, CollectorError, EngineError, OrchestratorError};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_ANALYSIS_DAYS: u32 = 7;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub api: Arc<dyn OrchestrationApi>,
    pub engine: Arc<DecisionEngine>,
    pub collector: Arc<TelemetryCollector>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        api: Arc<dyn OrchestrationApi>,
        engine: Arc<DecisionEngine>,
        collector: Arc<TelemetryCollector>,
    ) -> Self {
        Self {
            health_registry,
            api,
            engine,
            collector,
        }
    }

    /// Analyzer reflecting the engine's current exclusions and tuning
    async fn analyzer(&self) -> TrendAnalyzer {
        let config = self.engine.get_config().await;
        TrendAnalyzer::new(self.api.clone())
            .with_exclude_nodes(config.exclude_nodes)
            .with_trend_threshold(config.tuning.trend_threshold)
    }

    async fn forecaster(&self) -> Forecaster {
        let tuning = self.engine.get_config().await.tuning;
        Forecaster::with_config(self.analyzer().await, tuning.forecaster())
    }
}

/// Error returned by control endpoints as `{"error": ...}`
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Collector(CollectorError),
    Analysis(AnalysisError),
    BadRequest(String),
    Upstream(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<CollectorError> for ApiError {
    fn from(e: CollectorError) -> Self {
        ApiError::Collector(e)
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        ApiError::Analysis(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e) => {
                let status = match e {
                    EngineError::MigrationNotFound(_) => StatusCode::NOT_FOUND,
                    EngineError::AlreadyRunning | EngineError::NotRunning => StatusCode::CONFLICT,
                    EngineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                };
                (status, e.to_string())
            }
            ApiError::Collector(e) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Analysis(e) => {
                let status = match e {
                    AnalysisError::WorkloadNotFound(_)
                    | AnalysisError::Orchestrator(OrchestratorError::NotFound(_)) => {
                        StatusCode::NOT_FOUND
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
        };

        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.get_status().await)
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.get_config().await)
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<balancer_lib::engine::BalancerConfig> {
    Ok(Json(state.engine.update_config(update).await?))
}

async fn start_engine(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    state.engine.start().await?;
    info!("Decision engine started by operator");
    Ok(Json(json!({ "running": true })))
}

async fn stop_engine(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    state.engine.stop().await?;
    info!("Decision engine stopped by operator");
    Ok(Json(json!({ "running": false })))
}

async fn run_engine(State(state): State<Arc<AppState>>) -> ApiResult<TickOutcome> {
    match state.engine.run_once().await {
        TickOutcome::Failed { error } => Err(ApiError::Upstream(error)),
        outcome => Ok(Json(outcome)),
    }
}

async fn start_collector(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    state.collector.start(None).await?;
    Ok(Json(json!({ "running": true })))
}

async fn stop_collector(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    state.collector.stop().await?;
    Ok(Json(json!({ "running": false })))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<balancer_lib::MigrationRecord> {
    Ok(Json(state.engine.approve_migration(&id).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<balancer_lib::MigrationRecord> {
    Ok(Json(state.engine.reject_migration(&id).await?))
}

#[derive(Debug, Deserialize)]
struct TelemetryQuery {
    count: Option<usize>,
}

async fn telemetry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryQuery>,
) -> impl IntoResponse {
    Json(state.collector.get_buffered(query.count).await)
}

#[derive(Debug, Deserialize)]
struct AnalysisQuery {
    days: Option<u32>,
}

async fn workload_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<AnalysisQuery>,
) -> ApiResult<balancer_lib::analyzer::WorkloadAnalysis> {
    let days = query.days.unwrap_or(DEFAULT_ANALYSIS_DAYS);
    Ok(Json(state.analyzer().await.analyze_workload(&id, days).await?))
}

#[derive(Debug, Deserialize)]
struct ForecastQuery {
    hours: Option<usize>,
}

async fn workload_forecast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ForecastQuery>,
) -> ApiResult<balancer_lib::forecaster::WorkloadForecast> {
    let hours = match query.hours {
        Some(hours) if (1..=MAX_PREDICTION_HORIZON).contains(&hours) => hours,
        Some(hours) => {
            return Err(ApiError::BadRequest(format!(
                "hours {} is outside 1..={}",
                hours, MAX_PREDICTION_HORIZON
            )));
        }
        None => state.engine.get_config().await.prediction_horizon,
    };
    Ok(Json(state.forecaster().await.predict(&id, hours).await?))
}

async fn cluster_efficiency(
    State(state): State<Arc<AppState>>,
) -> ApiResult<balancer_lib::ClusterEfficiency> {
    let analyzer = state.analyzer().await;
    Ok(Json(
        analyzer
            .cluster_efficiency(analyzer.exclude_nodes())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct PowerQuery {
    node: Option<String>,
}

async fn cluster_power(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PowerQuery>,
) -> ApiResult<balancer_lib::forecaster::PowerReport> {
    let forecaster = state.forecaster().await;
    Ok(Json(
        forecaster
            .analyze_power_efficiency(query.node.as_deref())
            .await?,
    ))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/config", get(get_config).put(put_config))
        .route("/api/v1/engine/start", post(start_engine))
        .route("/api/v1/engine/stop", post(stop_engine))
        .route("/api/v1/engine/run", post(run_engine))
        .route("/api/v1/collector/start", post(start_collector))
        .route("/api/v1/collector/stop", post(stop_collector))
        .route("/api/v1/migrations/:id/approve", post(approve))
        .route("/api/v1/migrations/:id/reject", post(reject))
        .route("/api/v1/telemetry", get(telemetry))
        .route("/api/v1/workloads/:id/analysis", get(workload_analysis))
        .route("/api/v1/workloads/:id/forecast", get(workload_forecast))
        .route("/api/v1/cluster/efficiency", get(cluster_efficiency))
        .route("/api/v1/cluster/power", get(cluster_power))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use balancer_lib::engine::BalancerConfig;
    use balancer_lib::health::components;
    use balancer_lib::orchestrator::InMemoryCluster;
    use balancer_lib::WorkloadKind;
    use tower::ServiceExt;

    const GIB: u64 = 1 << 30;

    async fn setup_test_app() -> (Router, Arc<AppState>, Arc<InMemoryCluster>) {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node("pve1", 95.0, 4 * GIB, 16 * GIB).await;
        cluster.add_node("pve2", 10.0, 2 * GIB, 16 * GIB).await;
        cluster
            .add_workload(InMemoryCluster::workload("101", WorkloadKind::Vm, "pve1", 30.0, GIB))
            .await;

        let health_registry = HealthRegistry::new();
        health_registry.register(components::ENGINE).await;
        health_registry.register(components::COLLECTOR).await;

        let engine = Arc::new(DecisionEngine::new(cluster.clone(), BalancerConfig::default()));
        let collector = Arc::new(TelemetryCollector::new(cluster.clone(), Default::default()));
        let state = Arc::new(AppState::new(health_registry, cluster.clone(), engine, collector));

        (create_router(state.clone()), state, cluster)
    }

    async fn call(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz_and_readyz() {
        let (app, state, _) = setup_test_app().await;

        let (status, body) = call(app.clone(), Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, _) = call(app.clone(), Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.health_registry.set_ready(true).await;
        let (status, body) = call(app, Method::GET, "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_run_then_approve() {
        let (app, _, cluster) = setup_test_app().await;

        let (status, body) = call(app.clone(), Method::POST, "/api/v1/engine/run", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "planned");
        let id = body["migrations"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = call(app.clone(), Method::GET, "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending_migrations"].as_array().unwrap().len(), 1);
        assert_eq!(body["running"], false);

        let uri = format!("/api/v1/migrations/{}/approve", id);
        let (status, body) = call(app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(cluster.workload_node("101").await.as_deref(), Some("pve2"));
    }

    #[tokio::test]
    async fn test_unknown_migration_is_404() {
        let (app, _, _) = setup_test_app().await;

        let (status, body) =
            call(app.clone(), Method::POST, "/api/v1/migrations/nope/approve", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let (status, _) = call(app, Method::POST, "/api/v1/migrations/nope/reject", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_engine_state_conflicts() {
        let (app, state, _) = setup_test_app().await;

        let (status, _) = call(app.clone(), Method::POST, "/api/v1/engine/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(app.clone(), Method::POST, "/api/v1/engine/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);

        let (status, _) = call(app.clone(), Method::POST, "/api/v1/engine/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(app, Method::POST, "/api/v1/engine/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!state.engine.is_running().await);
    }

    #[tokio::test]
    async fn test_config_update() {
        let (app, state, _) = setup_test_app().await;

        let (status, body) = call(
            app.clone(),
            Method::PUT,
            "/api/v1/config",
            Some(r#"{"max_migrations_per_run": 1, "unknown_key": true}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["max_migrations_per_run"], 1);
        assert_eq!(state.engine.get_config().await.max_migrations_per_run, 1);

        let (status, body) = call(
            app,
            Method::PUT,
            "/api/v1/config",
            Some(r#"{"memory_threshold_low": 95}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert_eq!(state.engine.get_config().await.memory_threshold_low, 25.0);
    }

    #[tokio::test]
    async fn test_telemetry_and_cluster_views() {
        let (app, state, _) = setup_test_app().await;
        state.collector.collect_once().await;

        let (status, body) =
            call(app.clone(), Method::GET, "/api/v1/telemetry?count=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) =
            call(app.clone(), Method::GET, "/api/v1/cluster/efficiency", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_node_count"], 2);

        let (status, body) =
            call(app.clone(), Method::GET, "/api/v1/cluster/power?node=pve2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scope"], "pve2");

        let (status, _) =
            call(app, Method::GET, "/api/v1/workloads/999/analysis?days=1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_workload_forecast_uses_horizon() {
        let (app, _, _) = setup_test_app().await;

        let (status, body) =
            call(app, Method::GET, "/api/v1/workloads/101/forecast?hours=6", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["horizon_hours"], 6);
        assert_eq!(body["metrics"]["cpu"]["next_horizon"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_workload_forecast_rejects_out_of_range_hours() {
        let (app, _, _) = setup_test_app().await;

        for hours in ["0", "169", "18446744073709551615"] {
            let uri = format!("/api/v1/workloads/101/forecast?hours={}", hours);
            let (status, body) = call(app.clone(), Method::GET, &uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().unwrap().contains("hours"));
        }

        let (status, body) =
            call(app, Method::GET, "/api/v1/workloads/101/forecast?hours=168", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["horizon_hours"], 168);
    }
}
