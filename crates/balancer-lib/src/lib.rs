//! Cluster balancer library
//!
//! This crate provides the core functionality for:
//! - Telemetry collection from the cluster orchestration API
//! - Historical trend analysis and short-term load forecasting
//! - Migration planning and execution
//! - Health checks and observability

pub mod analyzer;
pub mod collector;
pub mod engine;
pub mod error;
pub mod forecaster;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod worker;

pub use error::{AnalysisError, CollectorError, EngineError, OrchestratorError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{BalancerMetrics, StructuredLogger};
