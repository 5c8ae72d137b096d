//! Worker: executes one task under heartbeat and checkpoint discipline.

pub mod heartbeat;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::{COST_PER_1K_TOKENS_USD, HEARTBEAT_INTERVAL};
use crate::errors::EngineError;
use crate::events::{Event, EventBus, EventPayload};
use crate::queue::{MessageHandler, QueueMessage};
use crate::registry::{ExecutionContext, ExecutorRegistry};
use crate::repo::TaskRepository;
use crate::store::StreamBackend;
use crate::task::{TaskMetrics, TaskOutcome, TaskSpec, TaskStatus, TaskType};
use heartbeat::HeartbeatHandle;

pub use pool::WorkerPool;

/// How one delivery of a task was resolved.
#[derive(Debug, Clone)]
pub enum TaskDisposition {
    /// The attempt ran to a terminal outcome (success or failure).
    Finished(TaskOutcome),
    /// Nothing to do: the task is already terminal or owned elsewhere.
    /// The delivery is acknowledged.
    Skipped,
    /// The task is preempted; the delivery stays pending so the consume
    /// loop re-fetches it after the scheduled resume.
    Deferred,
}

impl TaskDisposition {
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match self {
            Self::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }
}

/// Executes tasks pulled from the queue.
pub struct Worker {
    id: String,
    repo: Arc<TaskRepository>,
    checkpoints: Arc<CheckpointManager>,
    registry: Arc<dyn ExecutorRegistry>,
    backend: Arc<dyn StreamBackend>,
    events: Arc<EventBus>,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        repo: Arc<TaskRepository>,
        checkpoints: Arc<CheckpointManager>,
        registry: Arc<dyn ExecutorRegistry>,
        backend: Arc<dyn StreamBackend>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            id: id.into(),
            repo,
            checkpoints,
            registry,
            backend,
            events,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Shorten the heartbeat cadence (tests, embedded runs).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one task attempt end to end.
    ///
    /// At-least-once delivery makes non-runnable deliveries ordinary:
    /// terminal or concurrently-owned tasks are skipped, preempted tasks
    /// deferred for redelivery after their resume.
    pub async fn run_task(&self, spec: &TaskSpec) -> Result<TaskDisposition, EngineError> {
        let task_id = spec.id.ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("task spec arrived without a durable id"))
        })?;

        let task = self
            .repo
            .get_by_id(task_id)
            .map_err(EngineError::Database)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Preempted => {
                debug!(task_id, worker = %self.id, "task preempted; deferring delivery");
                return Ok(TaskDisposition::Deferred);
            }
            status => {
                debug!(
                    task_id,
                    status = status.as_str(),
                    worker = %self.id,
                    "skipping non-pending task delivery"
                );
                return Ok(TaskDisposition::Skipped);
            }
        }

        self.repo
            .update_status(task_id, TaskStatus::Running, Some(&self.id))
            .map_err(EngineError::Database)?;

        let checkpoint = self.checkpoints.load_checkpoint(task_id)?;
        let resuming = checkpoint.is_some();

        let cancel = CancellationToken::new();
        let heartbeat = HeartbeatHandle::start(
            task_id,
            self.id.clone(),
            Arc::clone(&self.repo),
            Arc::clone(&self.backend),
            cancel.clone(),
            self.heartbeat_interval,
        );

        let run_id = spec
            .input
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.events.publish(
            Event::new(&run_id, EventPayload::AgentStarted { agent: spec.target.clone() })
                .with_phase(spec.phase),
        );

        let ctx = ExecutionContext {
            input: spec.input.clone(),
            checkpoint: checkpoint.as_ref().map(|c| c.token.clone()),
            checkpoint_data: checkpoint.map(|c| c.data),
            save_checkpoint: self.checkpoints.checkpoint_callback(task_id),
            cancelled: cancel,
            budget: spec.budget,
        };

        debug!(task_id, target = %spec.target, worker = %self.id, resuming, "executing task");
        let started = Instant::now();
        let execution = match spec.task_type {
            TaskType::Agent => self.registry.execute_agent(&spec.target, ctx).await,
            TaskType::Tool => self.registry.execute_tool(&spec.target, ctx).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        heartbeat.stop().await;

        // The task may have been cancelled or preempted under us; the
        // unwind already owns the row, so this attempt commits nothing.
        let current = self
            .repo
            .get_by_id(task_id)
            .map_err(EngineError::Database)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        match current.status {
            TaskStatus::Cancelled => {
                debug!(task_id, "attempt cancelled externally; discarding result");
                return Ok(TaskDisposition::Skipped);
            }
            TaskStatus::Preempted => {
                debug!(task_id, "attempt preempted externally; deferring delivery");
                return Ok(TaskDisposition::Deferred);
            }
            _ => {}
        }

        match execution {
            Ok(output) => {
                let cost_usd = output.cost_usd.or_else(|| {
                    output
                        .tokens_used
                        .map(|tokens| tokens as f64 * COST_PER_1K_TOKENS_USD / 1_000.0)
                });
                let metrics = TaskMetrics {
                    duration_ms,
                    tokens_used: output.tokens_used,
                    cost_usd,
                };
                self.repo
                    .complete(task_id, &output.result, metrics)
                    .map_err(EngineError::Database)?;
                self.checkpoints.delete_checkpoint(task_id)?;
                info!(task_id, worker = %self.id, duration_ms, "task completed");
                self.events.publish(
                    Event::new(
                        &run_id,
                        EventPayload::AgentCompleted {
                            agent: spec.target.clone(),
                            cost: cost_usd.unwrap_or(0.0),
                            tokens: output.tokens_used.unwrap_or(0),
                            duration: duration_ms,
                            tools: output.artifacts.clone(),
                        },
                    )
                    .with_phase(spec.phase),
                );
                Ok(TaskDisposition::Finished(TaskOutcome::Completed {
                    result: output.result,
                    metrics,
                }))
            }
            Err(err) => {
                let retries = spec.retries + 1;
                let message = err.to_string();
                // Checkpoint is retained so the next attempt resumes.
                self.repo
                    .fail(task_id, &message, retries)
                    .map_err(EngineError::Database)?;
                warn!(task_id, worker = %self.id, error = %message, "task failed");
                self.events.publish(
                    Event::new(
                        &run_id,
                        EventPayload::AgentFailed {
                            agent: spec.target.clone(),
                            retry_count: retries,
                            retryable: true,
                        },
                    )
                    .with_phase(spec.phase),
                );
                Ok(TaskDisposition::Finished(TaskOutcome::Failed {
                    error: message,
                    retries,
                    duration_ms,
                }))
            }
        }
    }
}

/// Queue-facing adapter: parses the payload as a [`TaskSpec`] and runs it.
#[async_trait]
impl MessageHandler for Worker {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let spec: TaskSpec = match serde_json::from_value(message.payload.clone()) {
            Ok(spec) => spec,
            Err(err) => {
                // Poison payload: ack it away, it will never parse better.
                warn!(id = %message.id, %err, "discarding non-task payload");
                return Ok(());
            }
        };
        match self.run_task(&spec).await {
            // A deferred delivery stays unacked so the consume loop
            // re-fetches it once the task resumes.
            Ok(TaskDisposition::Deferred) => {
                anyhow::bail!("task {} deferred until resume", message.key)
            }
            Ok(_) => Ok(()),
            // Surfacing the error leaves the delivery pending for claim.
            Err(err) => Err(err.into()),
        }
    }
}
