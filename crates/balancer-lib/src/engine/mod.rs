//! Migration decision engine
//!
//! The control loop of the balancer. Each tick it:
//! - Classifies nodes from current load and a short forecast
//! - Picks migration candidates under cooldown and exclusion rules
//! - Scores targets and plans migrations up to the per-tick cap
//! - Executes plans immediately (auto-approve) or queues them for operators
//!
//! Pending migrations, history and cooldown timestamps live behind one
//! mutex owned by the engine. The lock is never held across an
//! orchestration API call.

mod config;
pub mod planner;

pub use config::{
    BalancerConfig, ConfigUpdate, PredictionGate, TuningConfig, MAX_PREDICTION_HORIZON,
};
pub use planner::{
    classify_nodes, find_best_target, load_score, plan_migrations, select_candidates,
    Classification, NodeLoad, OverloadedNode, PlanInput,
};

use crate::analyzer::{HistorySource, TrendAnalyzer};
use crate::error::{EngineError, OrchestratorError};
use crate::forecaster::Forecaster;
use crate::health::{components, HealthRegistry};
use crate::models::{MigrationRecord, MigrationStatus, NodeInfo, WorkloadInfo};
use crate::observability::{BalancerMetrics, StructuredLogger};
use crate::orchestrator::{eligible_nodes, node_workloads, OrchestrationApi, WorkloadHandle};
use crate::worker::{BackgroundWorker, DEFAULT_STOP_TIMEOUT};
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Entries of history included in a status report
pub const STATUS_HISTORY_LEN: usize = 10;

/// Result of one engine tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing was evaluated
    Skipped { reason: String },
    /// Plans made this tick, terminal when auto-approved, pending otherwise
    Planned { migrations: Vec<MigrationRecord> },
    /// The tick could not read the cluster
    Failed { error: String },
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Skipped { .. } => "skipped",
            TickOutcome::Planned { .. } => "planned",
            TickOutcome::Failed { .. } => "failed",
        }
    }

    /// Migrations planned by this tick
    pub fn migrations(&self) -> &[MigrationRecord] {
        match self {
            TickOutcome::Planned { migrations } => migrations,
            _ => &[],
        }
    }
}

/// Snapshot returned by [`DecisionEngine::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub pending_migrations: Vec<MigrationRecord>,
    /// Most recent history entries, oldest first
    pub recent_history: Vec<MigrationRecord>,
    pub config: BalancerConfig,
}

#[derive(Debug, Default)]
struct MigrationState {
    pending: Vec<MigrationRecord>,
    history: Vec<MigrationRecord>,
    last_migration: HashMap<String, DateTime<Utc>>,
}

struct EngineInner {
    api: Arc<dyn OrchestrationApi>,
    config: RwLock<BalancerConfig>,
    state: Mutex<MigrationState>,
    /// Serializes ticks from the loop and operator-triggered runs
    tick_lock: Mutex<()>,
    history_source: Option<Arc<dyn HistorySource>>,
    metrics: Option<BalancerMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

pub struct DecisionEngine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl DecisionEngine {
    pub fn new(api: Arc<dyn OrchestrationApi>, config: BalancerConfig) -> Self {
        let inner = EngineInner {
            api,
            config: RwLock::new(config),
            state: Mutex::new(MigrationState::default()),
            tick_lock: Mutex::new(()),
            history_source: None,
            metrics: None,
            health: None,
            logger: StructuredLogger::new("default"),
        };
        Self {
            inner: Arc::new(inner),
            worker: Mutex::new(None),
        }
    }

    fn configure(mut self, apply: impl FnOnce(&mut EngineInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => apply(inner),
            None => warn!("Decision engine already started, option ignored"),
        }
        self
    }

    pub fn with_metrics(self, metrics: BalancerMetrics) -> Self {
        self.configure(|inner| inner.metrics = Some(metrics))
    }

    pub fn with_health(self, health: HealthRegistry) -> Self {
        self.configure(|inner| inner.health = Some(health))
    }

    pub fn with_logger(self, logger: StructuredLogger) -> Self {
        self.configure(|inner| inner.logger = logger)
    }

    /// Forecast node load from `source` instead of the orchestration API
    pub fn with_history_source(self, source: Arc<dyn HistorySource>) -> Self {
        self.configure(|inner| inner.history_source = Some(source))
    }

    /// Start the periodic balancing loop
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| w.is_active()) {
            return Err(EngineError::AlreadyRunning);
        }

        let inner = self.inner.clone();
        *worker = Some(BackgroundWorker::spawn("decision-engine", move |shutdown| {
            run(inner, shutdown)
        }));

        if let Some(metrics) = &self.inner.metrics {
            metrics.set_engine_running(true);
        }
        if let Some(health) = &self.inner.health {
            health.set_healthy(components::ENGINE).await;
        }
        Ok(())
    }

    /// Stop the loop, letting an in-flight tick finish
    pub async fn stop(&self) -> Result<(), EngineError> {
        let worker = self.worker.lock().await.take();
        match worker {
            Some(w) if w.is_active() => {
                w.shutdown(DEFAULT_STOP_TIMEOUT).await;
                if let Some(metrics) = &self.inner.metrics {
                    metrics.set_engine_running(false);
                }
                Ok(())
            }
            _ => Err(EngineError::NotRunning),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| w.is_active())
    }

    /// Run one tick now
    pub async fn run_once(&self) -> TickOutcome {
        self.inner.tick(Utc::now()).await
    }

    /// Run one tick as if the wall clock read `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> TickOutcome {
        self.inner.tick(now).await
    }

    /// Execute a pending migration
    ///
    /// A failed migration is still returned as `Ok`; its record carries
    /// the failure.
    pub async fn approve_migration(&self, id: &str) -> Result<MigrationRecord, EngineError> {
        let record = self.inner.take_pending(id).await?;
        Ok(self.inner.execute(record).await)
    }

    /// Drop a pending migration without contacting the cluster
    pub async fn reject_migration(&self, id: &str) -> Result<MigrationRecord, EngineError> {
        let record = self
            .inner
            .take_pending(id)
            .await?
            .finish(MigrationStatus::Rejected, None, None);

        self.inner.state.lock().await.history.push(record.clone());
        self.inner.logger.log_migration_rejected(&record);
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_migrations_finished(MigrationStatus::Rejected);
        }
        Ok(record)
    }

    pub async fn get_status(&self) -> EngineStatus {
        let running = self.is_running().await;
        let config = self.get_config().await;
        let state = self.inner.state.lock().await;
        let skip = state.history.len().saturating_sub(STATUS_HISTORY_LEN);

        EngineStatus {
            running,
            pending_migrations: state.pending.clone(),
            recent_history: state.history[skip..].to_vec(),
            config,
        }
    }

    pub async fn get_config(&self) -> BalancerConfig {
        self.inner.config.read().await.clone()
    }

    /// Apply a partial update; the running loop picks it up next tick
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<BalancerConfig, EngineError> {
        let mut config = self.inner.config.write().await;
        let next = config.apply(update)?;
        *config = next.clone();
        info!(
            enabled = next.enabled,
            auto_approve = next.auto_approve,
            check_interval = next.check_interval,
            "Balancer configuration updated"
        );
        Ok(next)
    }

    pub async fn pending(&self) -> Vec<MigrationRecord> {
        self.inner.state.lock().await.pending.clone()
    }

    pub async fn history(&self) -> Vec<MigrationRecord> {
        self.inner.state.lock().await.history.clone()
    }

    pub async fn last_migration_time(&self, workload_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .state
            .lock()
            .await
            .last_migration
            .get(workload_id)
            .copied()
    }
}

async fn run(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    info!("Starting decision engine loop");

    loop {
        let outcome = inner.tick(Utc::now()).await;
        debug!(outcome = outcome.label(), "Engine tick complete");

        let interval = inner.config.read().await.tick_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => {
                info!("Shutting down decision engine loop");
                break;
            }
        }
    }
}

impl EngineInner {
    async fn take_pending(&self, id: &str) -> Result<MigrationRecord, EngineError> {
        let mut state = self.state.lock().await;
        let position = state
            .pending
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| EngineError::MigrationNotFound(id.to_string()))?;
        let record = state.pending.remove(position);
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_migrations(state.pending.len());
        }
        Ok(record)
    }

    async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;
        let start = Instant::now();
        let config = self.config.read().await.clone();

        let outcome = match self.evaluate(&config, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Balancing tick failed, retrying next interval");
                TickOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_tick_latency(start.elapsed().as_secs_f64());
            metrics.inc_ticks(outcome.label());
        }
        if let Some(health) = &self.health {
            match &outcome {
                TickOutcome::Failed { error } => {
                    health.set_degraded(components::ENGINE, error.clone()).await;
                    health
                        .set_unhealthy(components::ORCHESTRATOR, error.clone())
                        .await;
                }
                _ => {
                    health.set_healthy(components::ENGINE).await;
                    health.set_healthy(components::ORCHESTRATOR).await;
                }
            }
        }
        outcome
    }

    async fn evaluate(
        &self,
        config: &BalancerConfig,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, OrchestratorError> {
        if !config.enabled {
            return Ok(skipped("balancer disabled"));
        }

        let nodes = eligible_nodes(self.api.as_ref(), &config.exclude_nodes).await?;

        let preferred_hour = config.preferred_migration_hours.contains(&now.hour());
        if !preferred_hour && !any_high_load(&nodes, config) {
            return Ok(skipped("outside preferred migration hours"));
        }
        if nodes.len() < 2 {
            return Ok(skipped("fewer than two eligible nodes"));
        }

        let loads = self.node_loads(&nodes, config).await;
        let classification = classify_nodes(loads, config);
        debug!(
            overloaded = classification.overloaded.len(),
            underloaded = classification.underloaded.len(),
            "Classified nodes"
        );

        let sources: Vec<String> = if classification.overloaded.is_empty() {
            classification
                .underloaded
                .first()
                .filter(|_| classification.underloaded.len() > 1)
                .map(|l| vec![l.node.clone()])
                .unwrap_or_default()
        } else {
            classification
                .overloaded
                .iter()
                .map(|o| o.load.node.clone())
                .collect()
        };
        if sources.is_empty() {
            return Ok(TickOutcome::Planned {
                migrations: Vec::new(),
            });
        }
        let workloads = self.inventories(&sources).await;

        let (last_migration, pending) = {
            let state = self.state.lock().await;
            let pending: HashSet<String> =
                state.pending.iter().map(|r| r.workload_id.clone()).collect();
            (state.last_migration.clone(), pending)
        };

        let plans = plan_migrations(PlanInput {
            classification,
            workloads: &workloads,
            config,
            last_migration: &last_migration,
            pending: &pending,
            now,
        });

        let mut migrations = Vec::with_capacity(plans.len());
        for record in plans {
            self.logger.log_migration_planned(&record, config.auto_approve);
            if let Some(metrics) = &self.metrics {
                metrics.inc_migrations_planned(&record.reason.to_string());
            }

            if config.auto_approve {
                migrations.push(self.execute(record).await);
            } else {
                let mut state = self.state.lock().await;
                state.pending.push(record.clone());
                if let Some(metrics) = &self.metrics {
                    metrics.set_pending_migrations(state.pending.len());
                }
                migrations.push(record);
            }
        }

        Ok(TickOutcome::Planned { migrations })
    }

    /// Current load of each node plus its forecast under the prediction gate
    async fn node_loads(&self, nodes: &[NodeInfo], config: &BalancerConfig) -> Vec<NodeLoad> {
        let mut analyzer = TrendAnalyzer::new(self.api.clone())
            .with_exclude_nodes(config.exclude_nodes.clone())
            .with_trend_threshold(config.tuning.trend_threshold);
        if let Some(source) = &self.history_source {
            analyzer = analyzer.with_source(source.clone());
        }
        let forecaster = Forecaster::with_config(analyzer, config.tuning.forecaster());
        let horizon = config.prediction_horizon.min(MAX_PREDICTION_HORIZON);

        let mut loads = Vec::with_capacity(nodes.len());
        for node in nodes {
            let status = match self.api.node_status(&node.id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(node = %node.id, error = %e, "Skipping node this tick");
                    continue;
                }
            };
            let load = NodeLoad::current(
                &node.id,
                status.cpu_percent,
                status.memory.used,
                status.memory.total,
            );

            let load = match forecaster.predict_node(&node.id, horizon).await {
                Ok(forecast) if forecast.samples > 0 => {
                    let (cpu, memory) = match config.tuning.prediction_gate {
                        PredictionGate::Peak => (forecast.cpu.peak(), forecast.memory.peak()),
                        PredictionGate::SustainedAverage => {
                            (forecast.cpu.mean(), forecast.memory.mean())
                        }
                    };
                    load.with_prediction(cpu, memory)
                }
                Ok(_) => load,
                Err(e) => {
                    debug!(node = %node.id, error = %e, "No forecast, using current load");
                    load
                }
            };
            loads.push(load);
        }
        loads
    }

    async fn inventories(&self, nodes: &[String]) -> HashMap<String, Vec<WorkloadInfo>> {
        let mut inventories = HashMap::with_capacity(nodes.len());
        for node in nodes {
            match node_workloads(self.api.as_ref(), node).await {
                Ok(workloads) => {
                    inventories.insert(node.clone(), workloads);
                }
                Err(e) => warn!(node = %node, error = %e, "Could not list workloads"),
            }
        }
        inventories
    }

    /// Issue the migration and record its terminal state
    async fn execute(&self, record: MigrationRecord) -> MigrationRecord {
        let handle = WorkloadHandle::new(
            self.api.as_ref(),
            record.source_node.clone(),
            record.workload_id.clone(),
            record.workload_kind,
        );

        let response = handle.migrate(&record.target_node).await;
        let record = match response {
            Ok(response) if response.success => {
                record.finish(MigrationStatus::Success, Some(response.message), None)
            }
            Ok(response) => record.finish(MigrationStatus::Failed, None, Some(response.message)),
            Err(e) => record.finish(MigrationStatus::Failed, None, Some(e.to_string())),
        };

        {
            let mut state = self.state.lock().await;
            if record.status == MigrationStatus::Success {
                let completed = record.completion_time.unwrap_or_else(Utc::now);
                state
                    .last_migration
                    .insert(record.workload_id.clone(), completed);
            }
            state.history.push(record.clone());
        }

        self.logger.log_migration_completed(&record);
        if let Some(metrics) = &self.metrics {
            metrics.inc_migrations_finished(record.status);
        }
        record
    }
}

fn skipped(reason: &str) -> TickOutcome {
    TickOutcome::Skipped {
        reason: reason.to_string(),
    }
}

fn any_high_load(nodes: &[NodeInfo], config: &BalancerConfig) -> bool {
    nodes.iter().any(|n| {
        n.cpu_percent > config.cpu_threshold_high
            || n.memory.percent() > config.memory_threshold_high
    })
}
