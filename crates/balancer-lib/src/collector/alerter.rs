//! Threshold alerts on collected telemetry
//!
//! Handles:
//! - Comparing node CPU/memory and storage usage against warning and
//!   critical thresholds
//! - Deduplication of alerts within a configurable window
//! - Fan-out to operator-registered callbacks

use crate::models::{MetricKind, MetricSample, MetricScope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Details of the sample that crossed a threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertContext {
    pub kind: MetricKind,
    pub scope: MetricScope,
    pub scope_id: String,
    pub node: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: i64,
}

/// Operator callback invoked for every emitted alert
pub type AlertCallback = Arc<dyn Fn(AlertLevel, &str, &AlertContext) + Send + Sync>;

/// Warning and critical thresholds, in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub storage_warning: f64,
    pub storage_critical: f64,
    pub dedup_window_secs: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 85.0,
            memory_critical: 95.0,
            storage_warning: 85.0,
            storage_critical: 95.0,
            dedup_window_secs: DEFAULT_DEDUP_WINDOW_SECS,
        }
    }
}

impl AlertThresholds {
    fn classify(&self, value: f64, warning: f64, critical: f64) -> Option<(AlertLevel, f64)> {
        if value >= critical {
            Some((AlertLevel::Critical, critical))
        } else if value >= warning {
            Some((AlertLevel::Warning, warning))
        } else {
            None
        }
    }
}

/// An alert that passed deduplication
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub context: AlertContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    kind: MetricKind,
    scope_id: String,
    node: String,
    level: AlertLevel,
}

/// Threshold alerter with deduplication
pub struct Alerter {
    thresholds: AlertThresholds,
    dedup_window: Duration,
    recent_alerts: Mutex<HashMap<DedupKey, Instant>>,
    callbacks: Mutex<Vec<AlertCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new(AlertThresholds::default())
    }
}

impl Alerter {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            dedup_window: Duration::from_secs(thresholds.dedup_window_secs),
            thresholds,
            recent_alerts: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_callback(&self, callback: AlertCallback) {
        lock(&self.callbacks).push(callback);
    }

    pub fn callback_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Check one tick's samples and notify callbacks of new alerts
    pub fn evaluate(&self, samples: &[MetricSample]) -> Vec<Alert> {
        let alerts: Vec<Alert> = self
            .detect(samples)
            .into_iter()
            .filter(|alert| self.admit(alert))
            .collect();

        if alerts.is_empty() {
            return alerts;
        }

        let callbacks = lock(&self.callbacks).clone();
        for alert in &alerts {
            for callback in &callbacks {
                callback(alert.level, &alert.message, &alert.context);
            }
        }
        alerts
    }

    fn detect(&self, samples: &[MetricSample]) -> Vec<Alert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();
        let mut storage_totals: HashMap<(&str, &str), f64> = HashMap::new();

        for sample in samples {
            if sample.scope == MetricScope::Storage && sample.kind == MetricKind::StorageTotal {
                storage_totals.insert(
                    (sample.node.as_str(), sample.scope_id.as_str()),
                    sample.value,
                );
            }
        }

        for sample in samples {
            let (value, hit) = match (sample.scope, sample.kind) {
                (MetricScope::Node, MetricKind::Cpu) => (
                    sample.value,
                    t.classify(sample.value, t.cpu_warning, t.cpu_critical),
                ),
                (MetricScope::Node, MetricKind::Memory) => (
                    sample.value,
                    t.classify(sample.value, t.memory_warning, t.memory_critical),
                ),
                (MetricScope::Storage, MetricKind::StorageUsed) => {
                    match storage_totals.get(&(sample.node.as_str(), sample.scope_id.as_str())) {
                        Some(total) if *total > 0.0 => {
                            let percent = sample.value / total * 100.0;
                            (
                                percent,
                                t.classify(percent, t.storage_warning, t.storage_critical),
                            )
                        }
                        _ => continue,
                    }
                }
                _ => continue,
            };

            if let Some((level, threshold)) = hit {
                let message = format!(
                    "{} usage on {} {} at {:.1}% (threshold {:.1}%)",
                    sample.kind,
                    sample.scope.as_str(),
                    sample.scope_id,
                    value,
                    threshold
                );
                alerts.push(Alert {
                    level,
                    message,
                    context: AlertContext {
                        kind: sample.kind,
                        scope: sample.scope,
                        scope_id: sample.scope_id.clone(),
                        node: sample.node.clone(),
                        value,
                        threshold,
                        timestamp: sample.timestamp,
                    },
                });
            }
        }
        alerts
    }

    /// Record the alert unless an identical one fired within the window
    fn admit(&self, alert: &Alert) -> bool {
        let key = DedupKey {
            kind: alert.context.kind,
            scope_id: alert.context.scope_id.clone(),
            node: alert.context.node.clone(),
            level: alert.level,
        };

        let mut recent = lock(&self.recent_alerts);
        recent.retain(|_, time| time.elapsed() < self.dedup_window);
        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, Instant::now());
        true
    }
}
