//! Preemption policy: ordered rules mapping resource pressure to victim
//! selection.

use serde::{Deserialize, Serialize};

use crate::config::PreemptionConfig;
use crate::task::{PriorityClass, Task};

use super::resources::ResourceKind;

/// How victims are picked from the eligible running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    LongestRunning,
    Newest,
    HighestResource,
    LowestPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub resource: ResourceKind,
    /// Fires when utilization reaches this percentage.
    pub threshold_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    /// Classes eligible for preemption under this rule.
    pub preempt: Vec<PriorityClass>,
    /// How many victims to take.
    pub count: usize,
    pub selection: SelectionStrategy,
}

/// One entry of the ordered policy; higher `priority` evaluates first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionRule {
    pub name: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub priority: i32,
}

/// The standard two-tier policy derived from per-resource thresholds: at
/// the lower threshold shed one P3 task; at the higher threshold shed P2
/// and P3 together.
pub fn default_rules(config: &PreemptionConfig) -> Vec<PreemptionRule> {
    let axes = [
        (ResourceKind::Cpu, config.cpu),
        (ResourceKind::Memory, config.memory),
        (ResourceKind::Gpu, config.gpu),
        (ResourceKind::Budget, config.budget),
    ];
    let mut rules = Vec::with_capacity(axes.len() * 2);
    for (resource, thresholds) in axes {
        rules.push(PreemptionRule {
            name: format!("{resource}-p2"),
            condition: RuleCondition { resource, threshold_pct: thresholds.preempt_p2 },
            action: RuleAction {
                preempt: vec![PriorityClass::P2, PriorityClass::P3],
                count: 2,
                selection: SelectionStrategy::LowestPriority,
            },
            priority: 20,
        });
        rules.push(PreemptionRule {
            name: format!("{resource}-p3"),
            condition: RuleCondition { resource, threshold_pct: thresholds.preempt_p3 },
            action: RuleAction {
                preempt: vec![PriorityClass::P3],
                count: 1,
                selection: SelectionStrategy::LongestRunning,
            },
            priority: 10,
        });
    }
    rules
}

/// Pick up to `count` victim task ids from the running set, restricted to
/// the rule's classes and ordered by its selection strategy.
pub fn select_candidates(rule: &PreemptionRule, running: &[Task]) -> Vec<i64> {
    let mut eligible: Vec<&Task> = running
        .iter()
        .filter(|task| {
            task.priority_class.is_preemptible()
                && rule.action.preempt.contains(&task.priority_class)
        })
        .collect();

    match rule.action.selection {
        SelectionStrategy::LongestRunning => {
            eligible.sort_by_key(|task| task.started_at);
        }
        SelectionStrategy::Newest => {
            eligible.sort_by_key(|task| std::cmp::Reverse(task.started_at));
        }
        SelectionStrategy::HighestResource => {
            eligible.sort_by_key(|task| {
                std::cmp::Reverse((task.budget.tokens.unwrap_or(0), task.budget.ms))
            });
        }
        SelectionStrategy::LowestPriority => {
            eligible.sort_by_key(|task| std::cmp::Reverse(task.priority_class));
        }
    }

    eligible.into_iter().take(rule.action.count).map(|task| task.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PhaseName;
    use crate::task::{Budget, TaskStatus, TaskType};
    use chrono::{Duration as ChronoDuration, Utc};

    fn running_task(id: i64, class: PriorityClass, started_secs_ago: i64) -> Task {
        Task {
            id,
            phase_run_id: "pr-1".into(),
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: "agent".into(),
            input: serde_json::json!({}),
            retries: 0,
            budget: Budget { ms: 60_000, tokens: Some(1_000) },
            idempotence_key: format!("QA:{id:016x}"),
            status: TaskStatus::Running,
            worker_id: Some("w1".into()),
            started_at: Some(Utc::now() - ChronoDuration::seconds(started_secs_ago)),
            completed_at: None,
            last_heartbeat_at: Some(Utc::now()),
            result: None,
            error: None,
            cost_usd: None,
            tokens_used: None,
            duration_ms: None,
            priority_class: class,
            preempted: false,
            preemption_reason: None,
            preempted_at: None,
            resumed_at: None,
            preemption_count: 0,
            created_at: Utc::now(),
        }
    }

    fn rule(preempt: Vec<PriorityClass>, count: usize, selection: SelectionStrategy) -> PreemptionRule {
        PreemptionRule {
            name: "test".into(),
            condition: RuleCondition { resource: ResourceKind::Cpu, threshold_pct: 80.0 },
            action: RuleAction { preempt, count, selection },
            priority: 10,
        }
    }

    #[test]
    fn test_default_rules_cover_all_axes_twice() {
        let rules = default_rules(&PreemptionConfig::default());
        assert_eq!(rules.len(), 8);
        assert!(rules.iter().any(|r| r.name == "cpu-p3"));
        assert!(rules.iter().any(|r| r.name == "memory-p2"));
        // The p2 tier outranks the p3 tier.
        let p2 = rules.iter().find(|r| r.name == "cpu-p2").unwrap();
        let p3 = rules.iter().find(|r| r.name == "cpu-p3").unwrap();
        assert!(p2.priority > p3.priority);
        assert!(p2.condition.threshold_pct > p3.condition.threshold_pct);
    }

    #[test]
    fn test_longest_running_picks_oldest() {
        let tasks = vec![
            running_task(1, PriorityClass::P3, 600),
            running_task(2, PriorityClass::P3, 60),
        ];
        let picked = select_candidates(
            &rule(vec![PriorityClass::P3], 1, SelectionStrategy::LongestRunning),
            &tasks,
        );
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn test_newest_picks_latest() {
        let tasks = vec![
            running_task(1, PriorityClass::P3, 600),
            running_task(2, PriorityClass::P3, 60),
        ];
        let picked = select_candidates(
            &rule(vec![PriorityClass::P3], 1, SelectionStrategy::Newest),
            &tasks,
        );
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn test_p0_never_selected() {
        let tasks = vec![
            running_task(1, PriorityClass::P0, 600),
            running_task(2, PriorityClass::P2, 60),
        ];
        // Even a rule that (incorrectly) lists P0 cannot select it.
        let picked = select_candidates(
            &rule(
                vec![PriorityClass::P0, PriorityClass::P2],
                5,
                SelectionStrategy::LongestRunning,
            ),
            &tasks,
        );
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn test_lowest_priority_orders_p3_first() {
        let tasks = vec![
            running_task(1, PriorityClass::P2, 600),
            running_task(2, PriorityClass::P3, 60),
            running_task(3, PriorityClass::P2, 30),
        ];
        let picked = select_candidates(
            &rule(
                vec![PriorityClass::P2, PriorityClass::P3],
                2,
                SelectionStrategy::LowestPriority,
            ),
            &tasks,
        );
        assert_eq!(picked[0], 2);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_class_filter_excludes_out_of_rule_classes() {
        let tasks = vec![
            running_task(1, PriorityClass::P1, 600),
            running_task(2, PriorityClass::P3, 60),
        ];
        let picked = select_candidates(
            &rule(vec![PriorityClass::P3], 5, SelectionStrategy::LongestRunning),
            &tasks,
        );
        assert_eq!(picked, vec![2]);
    }
}
