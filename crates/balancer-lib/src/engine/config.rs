//! Decision engine configuration
//!
//! The full configuration is a typed struct with defaults for every key.
//! Runtime changes go through [`ConfigUpdate`], which names exactly the
//! keys operators may change; anything else in an update is ignored.

use crate::error::EngineError;
use crate::forecaster::{ForecasterConfig, PowerThresholds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// Longest forecast horizon accepted, one week of hourly points
pub const MAX_PREDICTION_HORIZON: usize = 168;

/// How the forecast is compared with the high threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionGate {
    /// Highest projected point
    #[default]
    Peak,
    /// Mean of the projection
    SustainedAverage,
}

/// Heuristic weights and thresholds of the planner and forecaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub headroom_weight: f64,
    pub balance_weight: f64,
    pub trend_threshold: f64,
    pub cpu_idle_threshold: f64,
    pub memory_idle_threshold: f64,
    pub consolidation_threshold: f64,
    pub min_forecast_samples: usize,
    /// Bytes of memory worth one point of CPU percent in the load score
    pub memory_score_divisor_bytes: u64,
    pub prediction_gate: PredictionGate,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            headroom_weight: 0.7,
            balance_weight: 0.3,
            trend_threshold: 0.10,
            cpu_idle_threshold: 20.0,
            memory_idle_threshold: 30.0,
            consolidation_threshold: 40.0,
            min_forecast_samples: 24,
            memory_score_divisor_bytes: 1 << 30,
            prediction_gate: PredictionGate::Peak,
        }
    }
}

impl TuningConfig {
    fn validate(&self) -> Result<(), EngineError> {
        for (name, weight) in [
            ("headroom_weight", self.headroom_weight),
            ("balance_weight", self.balance_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "tuning.{} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }
        if !(0.0..1.0).contains(&self.trend_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "tuning.trend_threshold {} is outside 0..1",
                self.trend_threshold
            )));
        }
        if self.memory_score_divisor_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "tuning.memory_score_divisor_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn forecaster(&self) -> ForecasterConfig {
        ForecasterConfig {
            min_samples: self.min_forecast_samples,
            trend_threshold: self.trend_threshold,
            power: PowerThresholds {
                cpu_idle: self.cpu_idle_threshold,
                memory_idle: self.memory_idle_threshold,
                consolidation: self.consolidation_threshold,
            },
            ..ForecasterConfig::default()
        }
    }
}

/// Balancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub enabled: bool,
    /// Seconds between engine ticks
    pub check_interval: u64,
    pub cpu_threshold_high: f64,
    pub cpu_threshold_low: f64,
    pub memory_threshold_high: f64,
    pub memory_threshold_low: f64,
    /// Seconds a workload stays ineligible after a successful migration
    pub migration_cooldown: u64,
    pub max_migrations_per_run: usize,
    /// Forecast horizon in hours
    pub prediction_horizon: usize,
    pub auto_approve: bool,
    pub preferred_migration_hours: BTreeSet<u32>,
    pub exclude_vms: HashSet<String>,
    pub exclude_nodes: HashSet<String>,
    pub tuning: TuningConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: 300,
            cpu_threshold_high: 80.0,
            cpu_threshold_low: 20.0,
            memory_threshold_high: 85.0,
            memory_threshold_low: 25.0,
            migration_cooldown: 3600,
            max_migrations_per_run: 3,
            prediction_horizon: 24,
            auto_approve: false,
            preferred_migration_hours: [1, 2, 3, 4, 5].into_iter().collect(),
            exclude_vms: HashSet::new(),
            exclude_nodes: HashSet::new(),
            tuning: TuningConfig::default(),
        }
    }
}

/// Partial configuration change; absent keys are left as they are
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub check_interval: Option<u64>,
    pub cpu_threshold_high: Option<f64>,
    pub cpu_threshold_low: Option<f64>,
    pub memory_threshold_high: Option<f64>,
    pub memory_threshold_low: Option<f64>,
    pub migration_cooldown: Option<u64>,
    pub max_migrations_per_run: Option<usize>,
    pub prediction_horizon: Option<usize>,
    pub auto_approve: Option<bool>,
    pub preferred_migration_hours: Option<BTreeSet<u32>>,
    pub exclude_vms: Option<HashSet<String>>,
    pub exclude_nodes: Option<HashSet<String>>,
    pub tuning: Option<TuningConfig>,
}

fn check_thresholds(name: &str, low: f64, high: f64) -> Result<(), EngineError> {
    for (label, value) in [("low", low), ("high", high)] {
        if !(0.0..=100.0).contains(&value) {
            return Err(EngineError::InvalidConfig(format!(
                "{} {} threshold {} is outside 0..=100",
                name, label, value
            )));
        }
    }
    if low >= high {
        return Err(EngineError::InvalidConfig(format!(
            "{} low threshold {} must be below high threshold {}",
            name, low, high
        )));
    }
    Ok(())
}

impl BalancerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_thresholds("cpu", self.cpu_threshold_low, self.cpu_threshold_high)?;
        check_thresholds("memory", self.memory_threshold_low, self.memory_threshold_high)?;

        if self.check_interval == 0 {
            return Err(EngineError::InvalidConfig(
                "check_interval must be at least one second".to_string(),
            ));
        }
        if let Some(hour) = self.preferred_migration_hours.iter().find(|h| **h > 23) {
            return Err(EngineError::InvalidConfig(format!(
                "preferred migration hour {} is not an hour of the day",
                hour
            )));
        }
        if !(1..=MAX_PREDICTION_HORIZON).contains(&self.prediction_horizon) {
            return Err(EngineError::InvalidConfig(format!(
                "prediction_horizon {} is outside 1..={} hours",
                self.prediction_horizon, MAX_PREDICTION_HORIZON
            )));
        }
        self.tuning.validate()
    }

    /// Merge `update` into a copy and return it if the result is valid
    pub fn apply(&self, update: ConfigUpdate) -> Result<BalancerConfig, EngineError> {
        let mut next = self.clone();

        macro_rules! merge {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(value) = update.$field {
                    next.$field = value;
                })+
            };
        }
        merge!(
            enabled,
            check_interval,
            cpu_threshold_high,
            cpu_threshold_low,
            memory_threshold_high,
            memory_threshold_low,
            migration_cooldown,
            max_migrations_per_run,
            prediction_horizon,
            auto_approve,
            preferred_migration_hours,
            exclude_vms,
            exclude_nodes,
            tuning,
        );

        next.validate()?;
        Ok(next)
    }
}
