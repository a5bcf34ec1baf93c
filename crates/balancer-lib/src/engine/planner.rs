//! Migration planning
//!
//! Pure functions over a snapshot of node loads and workload inventories.
//! The engine gathers the snapshot; everything here is deterministic so
//! the placement rules can be tested without a cluster.

use super::config::BalancerConfig;
use crate::models::{Candidate, MigrationReason, MigrationRecord, WorkloadInfo};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Current and predicted load of one node during planning
///
/// Planned moves are applied to the load immediately so later decisions
/// in the same tick see the projected state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLoad {
    pub node: String,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    /// Forecast CPU percent as selected by the prediction gate
    pub predicted_cpu: f64,
    /// Forecast memory percent as selected by the prediction gate
    pub predicted_memory: f64,
}

impl NodeLoad {
    /// Load with no forecast, predictions equal to the current values
    pub fn current(
        node: impl Into<String>,
        cpu_percent: f64,
        memory_used: u64,
        memory_total: u64,
    ) -> Self {
        let mut load = Self {
            node: node.into(),
            cpu_percent,
            memory_used,
            memory_total,
            predicted_cpu: cpu_percent,
            predicted_memory: 0.0,
        };
        load.predicted_memory = load.memory_percent();
        load
    }

    pub fn with_prediction(mut self, cpu_percent: f64, memory_percent: f64) -> Self {
        self.predicted_cpu = cpu_percent;
        self.predicted_memory = memory_percent;
        self
    }

    pub fn memory_percent(&self) -> f64 {
        self.memory_share(self.memory_used)
    }

    fn memory_share(&self, bytes: u64) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        bytes as f64 / self.memory_total as f64 * 100.0
    }

    /// Ordering key: the busier of the two resources
    pub fn pressure(&self) -> f64 {
        self.cpu_percent.max(self.memory_percent())
    }

    fn over_current(&self, config: &BalancerConfig) -> bool {
        self.cpu_percent > config.cpu_threshold_high
            || self.memory_percent() > config.memory_threshold_high
    }

    fn over_predicted(&self, config: &BalancerConfig) -> bool {
        self.predicted_cpu > config.cpu_threshold_high
            || self.predicted_memory > config.memory_threshold_high
    }

    fn under_low(&self, config: &BalancerConfig) -> bool {
        self.cpu_percent < config.cpu_threshold_low
            && self.memory_percent() < config.memory_threshold_low
    }

    /// CPU and memory percent after receiving `candidate`
    pub fn projected_with(&self, candidate: &Candidate) -> (f64, f64) {
        (
            self.cpu_percent + candidate.cpu_percent,
            self.memory_share(self.memory_used.saturating_add(candidate.memory_bytes)),
        )
    }

    fn assign(&mut self, candidate: &Candidate) {
        let memory_delta = self.memory_share(candidate.memory_bytes);
        self.cpu_percent += candidate.cpu_percent;
        self.memory_used = self.memory_used.saturating_add(candidate.memory_bytes);
        self.predicted_cpu += candidate.cpu_percent;
        self.predicted_memory += memory_delta;
    }

    fn release(&mut self, candidate: &Candidate) {
        let memory_delta = self.memory_share(candidate.memory_bytes);
        self.cpu_percent = (self.cpu_percent - candidate.cpu_percent).max(0.0);
        self.memory_used = self.memory_used.saturating_sub(candidate.memory_bytes);
        self.predicted_cpu = (self.predicted_cpu - candidate.cpu_percent).max(0.0);
        self.predicted_memory = (self.predicted_memory - memory_delta).max(0.0);
    }
}

/// Whether the current-load reason applies before the predicted one
pub fn overload_reason(load: &NodeLoad, config: &BalancerConfig) -> Option<MigrationReason> {
    if load.over_current(config) {
        Some(MigrationReason::CurrentHighLoad)
    } else if load.over_predicted(config) {
        Some(MigrationReason::PredictedHighLoad)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverloadedNode {
    pub load: NodeLoad,
    pub reason: MigrationReason,
}

/// Nodes split by load, each list in planning order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Busiest first
    pub overloaded: Vec<OverloadedNode>,
    /// Idlest first
    pub underloaded: Vec<NodeLoad>,
}

pub fn classify_nodes(loads: Vec<NodeLoad>, config: &BalancerConfig) -> Classification {
    let mut classification = Classification::default();
    for load in loads {
        if let Some(reason) = overload_reason(&load, config) {
            classification.overloaded.push(OverloadedNode { load, reason });
        } else if load.under_low(config) {
            classification.underloaded.push(load);
        }
    }

    classification
        .overloaded
        .sort_by(|a, b| b.load.pressure().total_cmp(&a.load.pressure()));
    classification
        .underloaded
        .sort_by(|a, b| a.pressure().total_cmp(&b.pressure()));
    classification
}

/// Combined weight of a workload for ordering candidates
pub fn load_score(candidate: &Candidate, memory_divisor_bytes: u64) -> f64 {
    candidate.cpu_percent + candidate.memory_bytes as f64 / memory_divisor_bytes.max(1) as f64
}

/// Whether a workload is still cooling down from its last migration
pub fn in_cooldown(
    workload_id: &str,
    last_migration: &HashMap<String, DateTime<Utc>>,
    cooldown_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    last_migration.get(workload_id).is_some_and(|last| {
        now.signed_duration_since(*last).num_seconds() < cooldown_secs as i64
    })
}

/// Workloads of a node that may be moved, heaviest first
///
/// Skips stopped workloads, excluded ids, workloads in cooldown and those
/// that already have a pending migration.
pub fn select_candidates(
    workloads: &[WorkloadInfo],
    config: &BalancerConfig,
    last_migration: &HashMap<String, DateTime<Utc>>,
    pending: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = workloads
        .iter()
        .filter(|w| w.running)
        .filter(|w| !config.exclude_vms.contains(&w.id))
        .filter(|w| !pending.contains(&w.id))
        .filter(|w| !in_cooldown(&w.id, last_migration, config.migration_cooldown, now))
        .map(Candidate::from)
        .collect();

    let divisor = config.tuning.memory_score_divisor_bytes;
    candidates.sort_by(|a, b| load_score(b, divisor).total_cmp(&load_score(a, divisor)));
    candidates
}

/// Index of the best target for `candidate`, if any can take it
///
/// A target is rejected when the move would push its CPU or memory over
/// the high threshold. Remaining targets are scored on the smaller of
/// their post-move headrooms and on how evenly CPU and memory are used.
pub fn find_best_target(
    candidate: &Candidate,
    source: &str,
    targets: &[NodeLoad],
    config: &BalancerConfig,
) -> Option<usize> {
    let tuning = &config.tuning;
    targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.node != source && t.memory_total > 0)
        .filter_map(|(i, target)| {
            let (cpu, memory) = target.projected_with(candidate);
            if cpu > config.cpu_threshold_high || memory > config.memory_threshold_high {
                return None;
            }
            let headroom = (100.0 - cpu).min(100.0 - memory);
            let balance = 100.0 - (cpu - memory).abs();
            Some((i, tuning.headroom_weight * headroom + tuning.balance_weight * balance))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Everything the planner needs for one tick
pub struct PlanInput<'a> {
    pub classification: Classification,
    /// Inventory of each node that may act as a source
    pub workloads: &'a HashMap<String, Vec<WorkloadInfo>>,
    pub config: &'a BalancerConfig,
    pub last_migration: &'a HashMap<String, DateTime<Utc>>,
    pub pending: &'a HashSet<String>,
    pub now: DateTime<Utc>,
}

/// Build this tick's migration plans
///
/// Overloaded nodes are relieved first. A source stops shedding as soon as
/// its projected load is back under both high thresholds, even when more
/// candidates remain and the per-tick cap has room. With no overloaded
/// node and several underloaded ones, the idlest node is emptied onto the
/// others.
pub fn plan_migrations(input: PlanInput<'_>) -> Vec<MigrationRecord> {
    let PlanInput {
        classification,
        workloads,
        config,
        last_migration,
        pending,
        now,
    } = input;
    let limit = config.max_migrations_per_run;
    let mut plans = Vec::new();
    if limit == 0 {
        return plans;
    }

    let Classification {
        overloaded,
        mut underloaded,
    } = classification;

    if !overloaded.is_empty() {
        for OverloadedNode { mut load, reason } in overloaded {
            if plans.len() >= limit {
                break;
            }
            let inventory = workloads.get(&load.node).map(Vec::as_slice).unwrap_or_default();
            for candidate in select_candidates(inventory, config, last_migration, pending, now) {
                if plans.len() >= limit || overload_reason(&load, config).is_none() {
                    break;
                }
                let Some(index) = find_best_target(&candidate, &load.node, &underloaded, config)
                else {
                    continue;
                };
                let target = &mut underloaded[index];
                target.assign(&candidate);
                load.release(&candidate);
                plans.push(MigrationRecord::plan(
                    &candidate,
                    &load.node,
                    &target.node,
                    reason,
                    now,
                ));
            }
        }
        return plans;
    }

    if underloaded.len() < 2 {
        return plans;
    }

    let source = underloaded.remove(0);
    let inventory = workloads.get(&source.node).map(Vec::as_slice).unwrap_or_default();
    for candidate in select_candidates(inventory, config, last_migration, pending, now) {
        if plans.len() >= limit {
            break;
        }
        if let Some(index) = find_best_target(&candidate, &source.node, &underloaded, config) {
            let target = &mut underloaded[index];
            target.assign(&candidate);
            plans.push(MigrationRecord::plan(
                &candidate,
                &source.node,
                &target.node,
                MigrationReason::Consolidation,
                now,
            ));
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadKind;
    use crate::orchestrator::InMemoryCluster;

    const GIB: u64 = 1 << 30;

    fn workload(id: &str, node: &str, cpu: f64, memory: u64) -> WorkloadInfo {
        InMemoryCluster::workload(id, WorkloadKind::Vm, node, cpu, memory)
    }

    fn candidate(cpu: f64, memory: u64) -> Candidate {
        Candidate::from(&workload("c", "x", cpu, memory))
    }

    #[test]
    fn test_classification_and_ordering() {
        let config = BalancerConfig::default();
        let loads = vec![
            NodeLoad::current("hot", 85.0, 2 * GIB, 8 * GIB),
            NodeLoad::current("hotter", 95.0, 2 * GIB, 8 * GIB),
            NodeLoad::current("idle", 10.0, GIB, 8 * GIB),
            NodeLoad::current("idler", 5.0, GIB / 2, 8 * GIB),
            NodeLoad::current("mid", 50.0, 4 * GIB, 8 * GIB),
            NodeLoad::current("soon", 50.0, 4 * GIB, 8 * GIB).with_prediction(90.0, 50.0),
        ];

        let classification = classify_nodes(loads, &config);
        let overloaded: Vec<_> = classification
            .overloaded
            .iter()
            .map(|o| (o.load.node.as_str(), o.reason))
            .collect();
        assert_eq!(
            overloaded,
            vec![
                ("hotter", MigrationReason::CurrentHighLoad),
                ("hot", MigrationReason::CurrentHighLoad),
                ("soon", MigrationReason::PredictedHighLoad),
            ]
        );
        let underloaded: Vec<_> = classification
            .underloaded
            .iter()
            .map(|l| l.node.as_str())
            .collect();
        assert_eq!(underloaded, vec!["idler", "idle"]);
    }

    #[test]
    fn test_current_reason_wins_over_predicted() {
        let config = BalancerConfig::default();
        let load = NodeLoad::current("n", 90.0, GIB, 8 * GIB).with_prediction(95.0, 10.0);
        assert_eq!(overload_reason(&load, &config), Some(MigrationReason::CurrentHighLoad));
    }

    #[test]
    fn test_target_admission_control() {
        let config = BalancerConfig::default();
        let targets = vec![
            NodeLoad::current("small", 60.0, GIB, 8 * GIB),
            NodeLoad::current("full-memory", 10.0, 7 * GIB, 8 * GIB),
        ];

        // 60 + 30 CPU would exceed 80
        assert_eq!(find_best_target(&candidate(30.0, GIB), "src", &targets, &config), None);
        // 60 + 10 fits; memory target is at 100% after the move
        assert_eq!(find_best_target(&candidate(10.0, GIB), "src", &targets, &config), Some(0));
    }

    #[test]
    fn test_target_prefers_headroom_and_skips_source() {
        let config = BalancerConfig::default();
        let targets = vec![
            NodeLoad::current("busy", 40.0, 3 * GIB, 8 * GIB),
            NodeLoad::current("free", 5.0, GIB, 8 * GIB),
        ];

        let c = candidate(10.0, GIB);
        assert_eq!(find_best_target(&c, "src", &targets, &config), Some(1));
        assert_eq!(find_best_target(&c, "free", &targets, &config), Some(0));
    }

    #[test]
    fn test_select_candidates_filters_and_orders() {
        let mut config = BalancerConfig::default();
        config.exclude_vms.insert("excluded".to_string());
        let now = Utc::now();

        let mut stopped = workload("stopped", "n", 50.0, GIB);
        stopped.running = false;
        let workloads = vec![
            workload("light", "n", 5.0, GIB),
            workload("heavy", "n", 30.0, 4 * GIB),
            workload("excluded", "n", 60.0, GIB),
            workload("cooling", "n", 40.0, GIB),
            workload("queued", "n", 40.0, GIB),
            stopped,
        ];
        let last_migration: HashMap<_, _> =
            [("cooling".to_string(), now - chrono::Duration::seconds(60))].into();
        let pending: HashSet<_> = ["queued".to_string()].into();

        let ids: Vec<_> = select_candidates(&workloads, &config, &last_migration, &pending, now)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["heavy", "light"]);
    }

    #[test]
    fn test_cooldown_expires() {
        let now = Utc::now();
        let last: HashMap<_, _> = [("w".to_string(), now - chrono::Duration::seconds(3601))].into();
        assert!(!in_cooldown("w", &last, 3600, now));
        assert!(in_cooldown("w", &last, 7200, now));
        assert!(!in_cooldown("other", &last, 3600, now));
    }

    #[test]
    fn test_plan_stops_once_source_relieved() {
        let config = BalancerConfig::default();
        let classification = classify_nodes(
            vec![
                NodeLoad::current("a", 92.0, 2 * GIB, 16 * GIB),
                NodeLoad::current("b", 10.0, 2 * GIB, 16 * GIB),
            ],
            &config,
        );
        let workloads: HashMap<_, _> = [(
            "a".to_string(),
            vec![workload("1", "a", 30.0, GIB), workload("2", "a", 20.0, GIB)],
        )]
        .into();

        let plans = plan_migrations(PlanInput {
            classification,
            workloads: &workloads,
            config: &config,
            last_migration: &HashMap::new(),
            pending: &HashSet::new(),
            now: Utc::now(),
        });

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].workload_id, "1");
        assert_eq!(plans[0].target_node, "b");
        assert_eq!(plans[0].reason, MigrationReason::CurrentHighLoad);
    }

    #[test]
    fn test_projected_load_accumulates_within_tick() {
        let config = BalancerConfig::default();
        let classification = classify_nodes(
            vec![
                NodeLoad::current("a", 100.0, 15 * GIB, 16 * GIB),
                NodeLoad::current("b", 15.0, 2 * GIB, 16 * GIB),
            ],
            &config,
        );
        let workloads: HashMap<_, _> = [(
            "a".to_string(),
            vec![
                workload("1", "a", 35.0, GIB),
                workload("2", "a", 34.0, GIB),
                workload("3", "a", 5.0, GIB),
            ],
        )]
        .into();

        let plans = plan_migrations(PlanInput {
            classification,
            workloads: &workloads,
            config: &config,
            last_migration: &HashMap::new(),
            pending: &HashSet::new(),
            now: Utc::now(),
        });

        // a stays over the memory threshold until two moves; on b,
        // 15 + 35 = 50 leaves no room for 34 but the 5 still fits
        let ids: Vec<_> = plans.iter().map(|p| p.workload_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn test_consolidation_empties_idlest_node() {
        let config = BalancerConfig::default();
        let classification = classify_nodes(
            vec![
                NodeLoad::current("a", 12.0, GIB, 16 * GIB),
                NodeLoad::current("b", 5.0, GIB / 2, 16 * GIB),
                NodeLoad::current("c", 14.0, GIB, 16 * GIB),
            ],
            &config,
        );
        let workloads: HashMap<_, _> =
            [("b".to_string(), vec![workload("9", "b", 4.0, GIB / 4)])].into();

        let plans = plan_migrations(PlanInput {
            classification,
            workloads: &workloads,
            config: &config,
            last_migration: &HashMap::new(),
            pending: &HashSet::new(),
            now: Utc::now(),
        });

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].source_node, "b");
        assert_eq!(plans[0].reason, MigrationReason::Consolidation);
        assert_ne!(plans[0].target_node, "b");
    }

    #[test]
    fn test_zero_cap_plans_nothing() {
        let config = BalancerConfig {
            max_migrations_per_run: 0,
            ..Default::default()
        };
        let classification = classify_nodes(
            vec![
                NodeLoad::current("a", 95.0, GIB, 16 * GIB),
                NodeLoad::current("b", 5.0, GIB, 16 * GIB),
            ],
            &config,
        );
        let workloads: HashMap<_, _> =
            [("a".to_string(), vec![workload("1", "a", 30.0, GIB)])].into();

        let plans = plan_migrations(PlanInput {
            classification,
            workloads: &workloads,
            config: &config,
            last_migration: &HashMap::new(),
            pending: &HashSet::new(),
            now: Utc::now(),
        });
        assert!(plans.is_empty());
    }
}
