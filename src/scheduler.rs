//! Scheduler: materializes a phase plan into deduplicated, budget-split
//! task specs and enqueues them.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::COST_PER_1K_TOKENS_USD;
use crate::errors::EngineError;
use crate::keys::key_of;
use crate::plan::PhasePlan;
use crate::queue::JobQueue;
use crate::repo::TaskRepository;
use crate::task::{Budget, TaskSpec, TaskType};

/// Keys whose list values [`Scheduler::shard_task`] recognizes.
const SHARDABLE_KEYS: &[&str] = &["questions", "tests", "items", "data", "list"];

/// Caller-supplied context for one scheduling pass.
#[derive(Debug, Clone)]
pub struct ScheduleContext {
    pub run_id: String,
    /// Unique id of this phase run; lands in every task's `input.phase_id`.
    pub phase_id: String,
    /// Phase inputs merged into each task's input map.
    pub inputs: Value,
}

/// What a scheduling pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleResult {
    pub task_ids: Vec<i64>,
    pub total_tasks: usize,
    /// Tasks actually appended to the stream; the rest were dedup hits.
    pub enqueued_tasks: usize,
}

/// Turns phase plans into enqueued tasks.
pub struct Scheduler {
    repo: Arc<TaskRepository>,
    queue: Arc<JobQueue>,
    topic: String,
}

impl Scheduler {
    pub fn new(repo: Arc<TaskRepository>, queue: Arc<JobQueue>, topic: impl Into<String>) -> Self {
        Self { repo, queue, topic: topic.into() }
    }

    /// Fan a plan out into one task per agent: insert the pending row,
    /// then enqueue keyed by the idempotence key. A dedup hit keeps the
    /// row (harmless) and does not count as enqueued.
    pub async fn schedule(
        &self,
        plan: &PhasePlan,
        ctx: &ScheduleContext,
    ) -> Result<ScheduleResult, EngineError> {
        let agent_count = plan.agents.len();
        if agent_count == 0 {
            return Err(EngineError::EmptyPlan);
        }
        let timebox_ms = plan.timebox_ms()?;
        let ms_per_task = timebox_ms / agent_count as u64;
        let tokens_per_task = plan.budgets.tokens / agent_count as u64;
        let max_cost_usd = tokens_per_task as f64 * COST_PER_1K_TOKENS_USD / 1_000.0;

        let mut task_ids = Vec::with_capacity(agent_count);
        let mut enqueued = 0usize;
        for target in &plan.agents {
            let mut input = base_input_map(&ctx.inputs);
            input.insert("run_id".into(), Value::String(ctx.run_id.clone()));
            input.insert("phase_id".into(), Value::String(ctx.phase_id.clone()));
            input.insert("rubrics".into(), plan.rubrics.clone());
            input.insert(
                "budget".into(),
                json!({"max_tokens": tokens_per_task, "max_cost_usd": max_cost_usd}),
            );

            let mut key_inputs = base_input_map(&ctx.inputs);
            key_inputs.insert("agent".into(), Value::String(target.clone()));
            let idempotence_key =
                key_of(plan.phase, &Value::Object(key_inputs), &plan.version);

            let mut spec = TaskSpec {
                id: None,
                phase: plan.phase,
                task_type: TaskType::Agent,
                target: target.clone(),
                input: Value::Object(input),
                retries: 0,
                budget: Budget { ms: ms_per_task, tokens: Some(tokens_per_task) },
                idempotence_key,
            };

            let id = self.repo.create(&spec).map_err(EngineError::Database)?;
            spec.id = Some(id);
            task_ids.push(id);

            let payload = serde_json::to_value(&spec)
                .map_err(|err| EngineError::Other(err.into()))?;
            let appended = self
                .queue
                .enqueue(&self.topic, &payload, Some(&spec.idempotence_key))
                .await?;
            match appended {
                Some(message_id) => {
                    enqueued += 1;
                    debug!(task_id = id, %message_id, target = %target, "task enqueued");
                }
                None => {
                    debug!(task_id = id, key = %spec.idempotence_key, "duplicate task absorbed");
                }
            }
        }

        info!(
            phase = %plan.phase,
            phase_run_id = %ctx.phase_id,
            total = agent_count,
            enqueued,
            "phase plan scheduled"
        );
        Ok(ScheduleResult { task_ids, total_tasks: agent_count, enqueued_tasks: enqueued })
    }

    /// Split a spec whose input carries an oversized list into shards.
    ///
    /// The first recognized list key longer than `shard_size` is split
    /// into contiguous chunks; each shard keeps only its slice and gains
    /// `input._shard = {index, total, start, end}` plus a suffixed
    /// idempotence key. Specs without such a list pass through untouched.
    pub fn shard_task(spec: &TaskSpec, shard_size: usize) -> Vec<TaskSpec> {
        if shard_size == 0 {
            return vec![spec.clone()];
        }
        let Some(object) = spec.input.as_object() else {
            return vec![spec.clone()];
        };
        let Some((key, list)) = SHARDABLE_KEYS.iter().find_map(|key| {
            object
                .get(*key)
                .and_then(Value::as_array)
                .filter(|list| list.len() > shard_size)
                .map(|list| (*key, list))
        }) else {
            return vec![spec.clone()];
        };

        let total = list.len().div_ceil(shard_size);
        let mut shards = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * shard_size;
            let end = (start + shard_size).min(list.len());
            let mut input = object.clone();
            input.insert(key.to_string(), Value::Array(list[start..end].to_vec()));
            input.insert(
                "_shard".to_string(),
                json!({"index": index, "total": total, "start": start, "end": end}),
            );
            shards.push(TaskSpec {
                id: None,
                phase: spec.phase,
                task_type: spec.task_type,
                target: spec.target.clone(),
                input: Value::Object(input),
                retries: spec.retries,
                budget: spec.budget,
                idempotence_key: format!("{}-shard-{}", spec.idempotence_key, index),
            });
        }
        shards
    }

    /// Mark every pending or running task of a phase run cancelled.
    /// Running tasks terminate at their next heartbeat boundary.
    pub async fn cancel_phase(&self, phase_run_id: &str) -> Result<usize, EngineError> {
        let cancelled = self.repo.cancel_phase(phase_run_id).map_err(EngineError::Database)?;
        info!(phase_run_id, cancelled, "phase cancelled");
        Ok(cancelled)
    }
}

fn base_input_map(inputs: &Value) -> Map<String, Value> {
    inputs.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::plan::{Parallelism, PhaseName, PlanBudgets};
    use crate::store::MemoryBackend;
    use crate::task::TaskStatus;
    use serde_json::json;

    fn plan(agents: &[&str], tokens: u64) -> PhasePlan {
        PhasePlan {
            phase: PhaseName::Qa,
            parallelism: Parallelism::Parallel,
            agents: agents.iter().map(|s| s.to_string()).collect(),
            budgets: PlanBudgets { tokens, tools_minutes: 30 },
            rubrics: json!({"coverage": 0.8}),
            timebox: "PT30M".to_string(),
            version: "1".to_string(),
        }
    }

    fn ctx() -> ScheduleContext {
        ScheduleContext {
            run_id: "run-1".to_string(),
            phase_id: "pr-1".to_string(),
            inputs: json!({"story": "S1"}),
        }
    }

    fn scheduler() -> Scheduler {
        let repo = Arc::new(TaskRepository::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryBackend::new()), QueueConfig::default()));
        Scheduler::new(repo, queue, "tasks")
    }

    #[tokio::test]
    async fn test_schedule_fans_out_one_task_per_agent() {
        let scheduler = scheduler();
        let result = scheduler.schedule(&plan(&["a", "b", "c"], 9_000), &ctx()).await.unwrap();
        assert_eq!(result.total_tasks, 3);
        assert_eq!(result.enqueued_tasks, 3);
        assert_eq!(result.task_ids.len(), 3);

        let tasks = scheduler.repo.get_by_phase("pr-1", None).unwrap();
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.input["run_id"], "run-1");
            assert_eq!(task.input["rubrics"]["coverage"], 0.8);
            assert_eq!(task.input["budget"]["max_tokens"], 3_000);
        }
        assert_eq!(scheduler.queue.get_queue_depth("tasks").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_budget_split_is_floored_and_bounded() {
        let scheduler = scheduler();
        let plan = plan(&["a", "b", "c"], 10_000);
        scheduler.schedule(&plan, &ctx()).await.unwrap();

        let tasks = scheduler.repo.get_by_phase("pr-1", None).unwrap();
        let per_task = 10_000u64 / 3;
        let sum: u64 = tasks.iter().map(|t| t.budget.tokens.unwrap()).sum();
        assert!(tasks.iter().all(|t| t.budget.tokens == Some(per_task)));
        assert_eq!(sum, per_task * 3);
        assert!(sum <= plan.budgets.tokens);

        let timebox_ms = plan.timebox_ms().unwrap();
        let ms_sum: u64 = tasks.iter().map(|t| t.budget.ms).sum();
        assert_eq!(ms_sum, (timebox_ms / 3) * 3);
        assert!(ms_sum <= timebox_ms);
    }

    #[tokio::test]
    async fn test_reschedule_is_deduplicated() {
        let scheduler = scheduler();
        let plan = plan(&["a", "b"], 2_000);
        let first = scheduler.schedule(&plan, &ctx()).await.unwrap();
        let second = scheduler.schedule(&plan, &ctx()).await.unwrap();

        assert_eq!(first.enqueued_tasks, 2);
        assert_eq!(second.enqueued_tasks, 0);
        // Rows are kept; the stream grows only once.
        assert_eq!(second.task_ids.len(), 2);
        assert_eq!(scheduler.queue.get_queue_depth("tasks").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_plan_rejected() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.schedule(&plan(&[], 1_000), &ctx()).await,
            Err(EngineError::EmptyPlan)
        ));
    }

    #[test]
    fn test_shard_partition_recovers_original_list() {
        let questions: Vec<Value> = (0..25).map(|n| json!(format!("q{n}"))).collect();
        let spec = TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: "qa-writer".into(),
            input: json!({"questions": questions, "story": "S1"}),
            retries: 0,
            budget: Budget { ms: 60_000, tokens: Some(1_000) },
            idempotence_key: "QA:0011223344556677".into(),
        };

        let shards = Scheduler::shard_task(&spec, 10);
        assert_eq!(shards.len(), 3);

        let mut recovered = Vec::new();
        for (index, shard) in shards.iter().enumerate() {
            let meta = &shard.input["_shard"];
            assert_eq!(meta["index"], index);
            assert_eq!(meta["total"], 3);
            let slice = shard.input["questions"].as_array().unwrap();
            assert_eq!(
                slice.len(),
                meta["end"].as_u64().unwrap() as usize - meta["start"].as_u64().unwrap() as usize
            );
            recovered.extend(slice.iter().cloned());
            assert!(shard
                .idempotence_key
                .starts_with(&format!("{}-shard-", spec.idempotence_key)));
            // Non-list input survives sharding.
            assert_eq!(shard.input["story"], "S1");
        }
        assert_eq!(recovered, spec.input["questions"].as_array().unwrap().clone());
    }

    #[test]
    fn test_shard_passthrough_for_small_lists() {
        let spec = TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: "qa-writer".into(),
            input: json!({"questions": ["q1", "q2"]}),
            retries: 0,
            budget: Budget { ms: 60_000, tokens: None },
            idempotence_key: "QA:0011223344556677".into(),
        };
        let shards = Scheduler::shard_task(&spec, 10);
        assert_eq!(shards.len(), 1);
        assert!(shards[0].input.get("_shard").is_none());
        assert_eq!(shards[0].idempotence_key, spec.idempotence_key);
    }

    #[tokio::test]
    async fn test_cancel_phase() {
        let scheduler = scheduler();
        scheduler.schedule(&plan(&["a", "b"], 2_000), &ctx()).await.unwrap();
        assert_eq!(scheduler.cancel_phase("pr-1").await.unwrap(), 2);
        let tasks = scheduler.repo.get_by_phase("pr-1", Some(TaskStatus::Cancelled)).unwrap();
        assert_eq!(tasks.len(), 2);
    }
}
