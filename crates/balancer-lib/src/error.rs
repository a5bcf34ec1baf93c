//! Error types shared across the balancer components

use thiserror::Error;

/// Failures talking to the cluster orchestration API
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("node {0} is unreachable")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0} not found")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Telemetry collector state errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("collector is already running")]
    AlreadyRunning,

    #[error("collector is not running")]
    NotRunning,
}

/// Decision engine errors surfaced to operators
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("decision engine is already running")]
    AlreadyRunning,

    #[error("decision engine is not running")]
    NotRunning,

    #[error("migration {0} not found")]
    MigrationNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from trend analysis and forecasting
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("workload {0} not found on any node")]
    WorkloadNotFound(String),

    #[error("no reachable nodes")]
    NoReachableNodes,

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}
