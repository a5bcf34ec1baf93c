//! Power and consolidation advice from current utilization

use serde::{Deserialize, Serialize};

/// Idle and consolidation verdict for a node or the whole cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReport {
    /// Node name, or `cluster` for the cluster-wide report
    pub scope: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub cpu_idle: bool,
    pub memory_idle: bool,
    pub consolidation_recommended: bool,
    /// Percentage points between average usage and the consolidation threshold
    pub savings_potential_percent: f64,
    pub recommendations: Vec<String>,
}

/// Thresholds used to judge utilization, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerThresholds {
    pub cpu_idle: f64,
    pub memory_idle: f64,
    pub consolidation: f64,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            cpu_idle: 20.0,
            memory_idle: 30.0,
            consolidation: 40.0,
        }
    }
}

pub fn assess(
    scope: impl Into<String>,
    cpu_usage: f64,
    memory_usage: f64,
    thresholds: &PowerThresholds,
) -> PowerReport {
    let scope = scope.into();
    let cpu_idle = cpu_usage < thresholds.cpu_idle;
    let memory_idle = memory_usage < thresholds.memory_idle;
    let average = (cpu_usage + memory_usage) / 2.0;
    let consolidation_recommended = average < thresholds.consolidation;
    let savings_potential_percent = (thresholds.consolidation - average).max(0.0);

    let mut recommendations = Vec::new();
    if cpu_idle {
        recommendations.push(format!(
            "CPU usage on {} is {:.1}%, below the idle threshold of {:.0}%",
            scope, cpu_usage, thresholds.cpu_idle
        ));
    }
    if memory_idle {
        recommendations.push(format!(
            "Memory usage on {} is {:.1}%, below the idle threshold of {:.0}%",
            scope, memory_usage, thresholds.memory_idle
        ));
    }
    if consolidation_recommended {
        recommendations.push(format!(
            "Average utilization {:.1}% is under {:.0}%, consolidate workloads to free up to {:.1}% capacity",
            average, thresholds.consolidation, savings_potential_percent
        ));
    }

    PowerReport {
        scope,
        cpu_usage,
        memory_usage,
        cpu_idle,
        memory_idle,
        consolidation_recommended,
        savings_potential_percent,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_node_recommends_consolidation() {
        let report = assess("pve1", 10.0, 20.0, &PowerThresholds::default());

        assert!(report.cpu_idle);
        assert!(report.memory_idle);
        assert!(report.consolidation_recommended);
        assert!((report.savings_potential_percent - 25.0).abs() < 1e-9);
        assert_eq!(report.recommendations.len(), 3);
    }

    #[test]
    fn test_busy_cluster_has_no_savings() {
        let report = assess("cluster", 60.0, 70.0, &PowerThresholds::default());

        assert!(!report.cpu_idle);
        assert!(!report.memory_idle);
        assert!(!report.consolidation_recommended);
        assert_eq!(report.savings_potential_percent, 0.0);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_idle_cpu_alone_does_not_consolidate() {
        let report = assess("pve2", 15.0, 80.0, &PowerThresholds::default());

        assert!(report.cpu_idle);
        assert!(!report.consolidation_recommended);
        assert_eq!(report.recommendations.len(), 1);
    }
}
