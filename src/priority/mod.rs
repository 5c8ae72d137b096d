//! Priority scheduler: P0-P3 classes, utilization-driven preemption, and
//! scheduled resume.

pub mod policy;
pub mod resources;

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::PreemptionConfig;
use crate::errors::EngineError;
use crate::events::{Event, EventBus, EventPayload};
use crate::repo::{PriorityAssignment, TaskRepository};
use crate::task::PriorityClass;

pub use policy::{default_rules, select_candidates, PreemptionRule, SelectionStrategy};
pub use resources::{compute_utilization, ResourceKind, ResourceUtilization};

/// A request to pin a task's priority class.
#[derive(Debug, Clone)]
pub struct AssignPriorityRequest {
    pub task_id: i64,
    pub class: PriorityClass,
    pub reason: Option<String>,
    /// Whether a later assignment may replace this one. Does not affect
    /// preemption eligibility, which derives from the class alone.
    pub overridable: bool,
}

/// Watches resource pressure and preempts preemptible running tasks.
pub struct PriorityScheduler {
    repo: Arc<TaskRepository>,
    checkpoints: Arc<CheckpointManager>,
    config: PreemptionConfig,
    /// Policy rules, pre-sorted by rule priority descending.
    rules: Vec<PreemptionRule>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl PriorityScheduler {
    pub fn new(
        repo: Arc<TaskRepository>,
        checkpoints: Arc<CheckpointManager>,
        config: PreemptionConfig,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let rules = default_rules(&config);
        Self::with_rules(repo, checkpoints, config, rules, events)
    }

    /// Construct with a custom policy instead of the default two-tier one.
    pub fn with_rules(
        repo: Arc<TaskRepository>,
        checkpoints: Arc<CheckpointManager>,
        config: PreemptionConfig,
        mut rules: Vec<PreemptionRule>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        Arc::new(Self {
            repo,
            checkpoints,
            config,
            rules,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Pin a task's priority class. Fails when a prior non-overridable
    /// assignment exists.
    pub fn assign_priority(&self, request: &AssignPriorityRequest) -> Result<(), EngineError> {
        if let Some(existing) = self
            .repo
            .get_priority(request.task_id)
            .map_err(EngineError::Database)?
        {
            if !existing.overridable {
                return Err(EngineError::PriorityLocked { id: request.task_id });
            }
        }
        self.repo
            .set_priority(
                request.task_id,
                &PriorityAssignment {
                    class: request.class,
                    reason: request.reason.clone(),
                    overridable: request.overridable,
                },
            )
            .map_err(EngineError::Database)?;
        debug!(
            task_id = request.task_id,
            class = request.class.as_str(),
            "priority assigned"
        );
        Ok(())
    }

    /// Current utilization snapshot.
    pub fn get_utilization(&self) -> Result<ResourceUtilization, EngineError> {
        compute_utilization(&self.repo)
    }

    /// One policy evaluation pass: for the first rule whose resource is at
    /// or over threshold, preempt the selected candidates. Returns how
    /// many tasks were preempted.
    pub async fn evaluate_preemption_policy(self: &Arc<Self>) -> Result<usize, EngineError> {
        if !self.config.enable_preemption {
            return Ok(0);
        }
        let utilization = self.get_utilization()?;
        for rule in &self.rules {
            let pct = utilization.percent_of(rule.condition.resource);
            if pct < rule.condition.threshold_pct {
                continue;
            }
            info!(
                rule = %rule.name,
                resource = %rule.condition.resource,
                utilization = pct,
                threshold = rule.condition.threshold_pct,
                "preemption rule fired"
            );
            if rule.condition.resource == ResourceKind::Budget {
                self.events.publish(Event::new(
                    "system",
                    EventPayload::BudgetThresholdExceeded {
                        resource: rule.condition.resource.as_str().to_string(),
                        used_pct: pct,
                    },
                ));
            }
            let running = self.repo.get_running().map_err(EngineError::Database)?;
            let candidates = select_candidates(rule, &running);
            let reason = format!(
                "{} utilization {:.0}% over threshold {:.0}%",
                rule.condition.resource, pct, rule.condition.threshold_pct
            );
            let mut preempted = 0;
            for task_id in candidates {
                if self
                    .preempt_task(task_id, &reason, Some(rule.condition.resource))
                    .await?
                {
                    preempted += 1;
                }
            }
            return Ok(preempted);
        }
        Ok(0)
    }

    /// Preempt one task: checkpoint, flip to `preempted` with its history
    /// row, and schedule the resume. Silently refuses non-preemptible
    /// classes; a task at the preemption limit is failed instead.
    pub async fn preempt_task(
        self: &Arc<Self>,
        task_id: i64,
        reason: &str,
        resource: Option<ResourceKind>,
    ) -> Result<bool, EngineError> {
        let class = self
            .repo
            .effective_priority(task_id)
            .map_err(EngineError::Database)?;
        if !class.is_preemptible() {
            debug!(task_id, class = class.as_str(), "not preemptible; skipping");
            return Ok(false);
        }

        let task = self
            .repo
            .get_by_id(task_id)
            .map_err(EngineError::Database)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        if task.preemption_count >= self.config.max_preemptions {
            let message =
                format!("Exceeded max preemptions ({})", self.config.max_preemptions);
            warn!(task_id, %message, "failing task");
            self.repo
                .fail(task_id, &message, task.retries)
                .map_err(EngineError::Database)?;
            return Ok(false);
        }

        // Keep the executor's own checkpoint if it already saved one; the
        // marker only guarantees resume always has something to load.
        if self.checkpoints.load_checkpoint(task_id)?.is_none() {
            self.checkpoints.save_checkpoint(
                task_id,
                "preempted",
                &json!({
                    "reason": reason,
                    "preempted_at": chrono::Utc::now().to_rfc3339(),
                }),
            )?;
        }

        self.repo
            .mark_preempted(task_id, reason, resource.map(|r| r.as_str()))
            .map_err(EngineError::Database)?;
        info!(task_id, reason, "task preempted");

        self.schedule_resume(task_id);
        Ok(true)
    }

    /// Try to return a preempted task to the queue. Returns `false` when
    /// resource pressure still warrants preemption (caller retries later).
    pub async fn resume_preempted_task(&self, task_id: i64) -> Result<bool, EngineError> {
        let utilization = self.get_utilization()?;
        if self.pressure_remains(&utilization) {
            debug!(task_id, "resume deferred; pressure remains");
            return Ok(false);
        }
        self.repo.mark_resumed(task_id).map_err(EngineError::Database)?;
        info!(task_id, "preempted task resumed to pending");
        Ok(true)
    }

    fn pressure_remains(&self, utilization: &ResourceUtilization) -> bool {
        self.rules.iter().any(|rule| {
            utilization.percent_of(rule.condition.resource) >= rule.condition.threshold_pct
        })
    }

    /// Spawn the delayed resume loop for a preempted task. The ordinary
    /// consume loop picks the task back up once it is `pending` again.
    fn schedule_resume(self: &Arc<Self>, task_id: i64) {
        let scheduler = Arc::downgrade(self);
        let delay = self.config.retry_delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(scheduler) = scheduler.upgrade() else { break };
                match scheduler.resume_preempted_task(task_id).await {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(task_id, %err, "resume attempt failed");
                        break;
                    }
                }
            }
        });
    }

    /// Run `evaluate_preemption_policy` on the configured timer until
    /// [`stop`] is called.
    ///
    /// [`stop`]: PriorityScheduler::stop
    pub fn start_monitoring(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::downgrade(self);
        let interval = self.config.monitor_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(scheduler) = scheduler.upgrade() else { break };
                if let Err(err) = scheduler.evaluate_preemption_policy().await {
                    warn!(%err, "preemption evaluation failed");
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::keys::key_of;
    use crate::plan::PhaseName;
    use crate::task::{Budget, TaskSpec, TaskStatus, TaskType};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        repo: Arc<TaskRepository>,
        checkpoints: Arc<CheckpointManager>,
        scheduler: Arc<PriorityScheduler>,
    }

    fn fixture(config: PreemptionConfig) -> Fixture {
        let repo = Arc::new(TaskRepository::open_in_memory().unwrap());
        let checkpoints =
            Arc::new(CheckpointManager::open_in_memory(CheckpointConfig::default()).unwrap());
        let scheduler = PriorityScheduler::new(
            Arc::clone(&repo),
            Arc::clone(&checkpoints),
            config,
            Arc::new(EventBus::new()),
        );
        Fixture { repo, checkpoints, scheduler }
    }

    fn running_task(repo: &TaskRepository, target: &str, class: PriorityClass) -> i64 {
        let input = json!({"phase_id": "pr-1", "agent": target});
        let spec = TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: target.to_string(),
            idempotence_key: key_of(PhaseName::Qa, &input, "1"),
            input,
            retries: 0,
            budget: Budget { ms: 60_000, tokens: Some(1_000) },
        };
        let id = repo.create(&spec).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("w1")).unwrap();
        repo.set_priority(
            id,
            &PriorityAssignment { class, reason: None, overridable: true },
        )
        .unwrap();
        id
    }

    #[test]
    fn test_assign_priority_respects_lock() {
        let fixture = fixture(PreemptionConfig::default());
        let id = running_task(&fixture.repo, "a", PriorityClass::P2);

        fixture
            .scheduler
            .assign_priority(&AssignPriorityRequest {
                task_id: id,
                class: PriorityClass::P1,
                reason: Some("interactive".into()),
                overridable: false,
            })
            .unwrap();

        // Locked: a second assignment fails.
        let err = fixture
            .scheduler
            .assign_priority(&AssignPriorityRequest {
                task_id: id,
                class: PriorityClass::P3,
                reason: None,
                overridable: true,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::PriorityLocked { .. }));
        assert_eq!(fixture.repo.effective_priority(id).unwrap(), PriorityClass::P1);
    }

    #[tokio::test]
    async fn test_policy_preempts_longest_running_p3() {
        let fixture = fixture(PreemptionConfig::default().with_retry_delay(Duration::from_secs(60)));
        // 82% of the 8-core fallback capacity.
        fixture.repo.record_usage("acme", "cpu", 6.56).unwrap();

        let old = running_task(&fixture.repo, "old", PriorityClass::P3);
        std::thread::sleep(Duration::from_millis(10));
        let young = running_task(&fixture.repo, "young", PriorityClass::P3);

        let preempted = fixture.scheduler.evaluate_preemption_policy().await.unwrap();
        assert_eq!(preempted, 1);

        let victim = fixture.repo.get_by_id(old).unwrap().unwrap();
        assert_eq!(victim.status, TaskStatus::Preempted);
        assert!(victim.preempted);
        assert_eq!(victim.preemption_count, 1);
        assert!(victim.preemption_reason.unwrap().contains("cpu"));
        assert!(fixture.checkpoints.load_checkpoint(old).unwrap().is_some());

        let survivor = fixture.repo.get_by_id(young).unwrap().unwrap();
        assert_eq!(survivor.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_resume_deferred_until_pressure_clears() {
        let fixture = fixture(PreemptionConfig::default().with_retry_delay(Duration::from_secs(60)));
        fixture.repo.record_usage("acme", "cpu", 6.56).unwrap();
        let id = running_task(&fixture.repo, "a", PriorityClass::P3);

        assert!(fixture.scheduler.preempt_task(id, "cpu pressure", Some(ResourceKind::Cpu)).await.unwrap());

        // Still hot: resume defers.
        assert!(!fixture.scheduler.resume_preempted_task(id).await.unwrap());
        assert_eq!(fixture.repo.get_by_id(id).unwrap().unwrap().status, TaskStatus::Preempted);

        // Double the capacity; utilization drops to 41%.
        fixture.repo.set_quota("acme", "cpu", 16.0).unwrap();
        assert!(fixture.scheduler.resume_preempted_task(id).await.unwrap());

        let task = fixture.repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.preempted);
        assert!(task.resumed_at.is_some());
        assert_eq!(task.preemption_count, 1);
    }

    #[tokio::test]
    async fn test_p0_is_never_preempted() {
        let fixture = fixture(PreemptionConfig::default());
        let id = running_task(&fixture.repo, "critical", PriorityClass::P0);

        assert!(!fixture.scheduler.preempt_task(id, "pressure", None).await.unwrap());
        assert_eq!(fixture.repo.get_by_id(id).unwrap().unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_max_preemptions_fails_task() {
        let fixture = fixture(
            PreemptionConfig::default().with_retry_delay(Duration::from_secs(3_600)),
        );
        let id = running_task(&fixture.repo, "a", PriorityClass::P3);

        for round in 0..3 {
            assert!(
                fixture.scheduler.preempt_task(id, "pressure", None).await.unwrap(),
                "preemption {round} accepted"
            );
            fixture.repo.mark_resumed(id).unwrap();
            fixture.repo.update_status(id, TaskStatus::Running, Some("w1")).unwrap();
        }

        // Fourth trigger: over the limit, the task is failed instead.
        assert!(!fixture.scheduler.preempt_task(id, "pressure", None).await.unwrap());
        let task = fixture.repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Exceeded max preemptions (3)"));
    }

    #[tokio::test]
    async fn test_scheduled_resume_round_trip() {
        let fixture = fixture(
            PreemptionConfig::default().with_retry_delay(Duration::from_millis(50)),
        );
        // No resource pressure: the scheduled resume succeeds first try.
        let id = running_task(&fixture.repo, "a", PriorityClass::P3);
        assert!(fixture.scheduler.preempt_task(id, "manual", None).await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let task = fixture.repo.get_by_id(id).unwrap().unwrap();
                if task.status == TaskStatus::Pending {
                    assert!(!task.preempted);
                    assert!(task.resumed_at.is_some());
                    assert_eq!(task.preemption_count, 1);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task resumed to pending");
        fixture.scheduler.stop();
    }

    #[tokio::test]
    async fn test_disabled_preemption_is_inert() {
        let fixture = fixture(PreemptionConfig::disabled());
        fixture.repo.record_usage("acme", "cpu", 8.0).unwrap();
        running_task(&fixture.repo, "a", PriorityClass::P3);
        assert_eq!(fixture.scheduler.evaluate_preemption_policy().await.unwrap(), 0);
    }
}
