//! Worker pool: owns the consumer loops, manual and queue-depth-driven
//! scaling, and the pending-entry scavenger that adopts work from dead
//! consumers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::{WorkerPoolConfig, HEARTBEAT_INTERVAL};
use crate::errors::EngineError;
use crate::events::EventBus;
use crate::queue::JobQueue;
use crate::registry::ExecutorRegistry;
use crate::repo::TaskRepository;
use crate::worker::Worker;

struct WorkerSlot {
    consumer: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<WorkerSlot>,
    background: Vec<JoinHandle<()>>,
}

/// Owns N workers and their consume loops against one topic and consumer
/// group.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    repo: Arc<TaskRepository>,
    checkpoints: Arc<CheckpointManager>,
    registry: Arc<dyn ExecutorRegistry>,
    events: Arc<EventBus>,
    heartbeat_interval: Duration,
    state: tokio::sync::Mutex<PoolState>,
    running: AtomicBool,
    next_worker: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        repo: Arc<TaskRepository>,
        checkpoints: Arc<CheckpointManager>,
        registry: Arc<dyn ExecutorRegistry>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            repo,
            checkpoints,
            registry,
            events,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            state: tokio::sync::Mutex::new(PoolState::default()),
            running: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Shorten worker heartbeats (tests, embedded runs). Call before
    /// `start`.
    pub fn set_heartbeat_interval(self: &mut Arc<Self>, interval: Duration) {
        if let Some(pool) = Arc::get_mut(self) {
            pool.heartbeat_interval = interval;
        }
    }

    /// Spawn the configured workers, the PEL scavenger, and (when
    /// enabled) the autoscaler.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        for _ in 0..self.config.concurrency {
            self.spawn_slot(&mut state);
        }

        state.background.push(self.spawn_scavenger());
        if self.config.auto_scale {
            state.background.push(self.spawn_autoscaler());
        }
        info!(
            workers = state.slots.len(),
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            "worker pool started"
        );
        Ok(())
    }

    fn make_worker(&self, consumer: &str) -> Arc<Worker> {
        Arc::new(
            Worker::new(
                consumer,
                Arc::clone(&self.repo),
                Arc::clone(&self.checkpoints),
                Arc::clone(&self.registry),
                self.queue.backend(),
                Arc::clone(&self.events),
            )
            .with_heartbeat_interval(self.heartbeat_interval),
        )
    }

    fn spawn_slot(self: &Arc<Self>, state: &mut PoolState) {
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let consumer = format!("worker-{n}");
        let worker = self.make_worker(&consumer);
        let queue = Arc::clone(&self.queue);
        let topic = self.config.topic.clone();
        let group = self.config.consumer_group.clone();
        let name = consumer.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = queue.consume(&topic, &group, &name, worker).await {
                warn!(consumer = %name, %err, "consume loop exited with error");
            }
        });
        debug!(consumer = %consumer, "worker spawned");
        state.slots.push(WorkerSlot { consumer, handle });
    }

    /// Converge to `target` workers. Removal stops the consumer, waits the
    /// grace period, then reaps the loop.
    pub async fn scale(self: &Arc<Self>, target: usize) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let current = state.slots.len();
        if target > current {
            for _ in current..target {
                self.spawn_slot(&mut state);
            }
            info!(from = current, to = target, "scaled up");
            return Ok(());
        }
        if target < current {
            let removed: Vec<WorkerSlot> = state.slots.split_off(target);
            for slot in &removed {
                self.queue.stop_consumer(
                    &self.config.topic,
                    &self.config.consumer_group,
                    &slot.consumer,
                );
            }
            tokio::time::sleep(self.config.shutdown_grace).await;
            for slot in removed {
                if tokio::time::timeout(self.config.shutdown_grace, slot.handle)
                    .await
                    .is_err()
                {
                    warn!(consumer = %slot.consumer, "consumer did not stop in time");
                }
            }
            info!(from = current, to = target, "scaled down");
        }
        Ok(())
    }

    /// Stop all consumers, wait the grace interval for in-flight handlers,
    /// and shut the queue down.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        for slot in &state.slots {
            self.queue.stop_consumer(
                &self.config.topic,
                &self.config.consumer_group,
                &slot.consumer,
            );
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        for slot in state.slots.drain(..) {
            if tokio::time::timeout(self.config.shutdown_grace, slot.handle)
                .await
                .is_err()
            {
                warn!(consumer = %slot.consumer, "consumer did not stop in time; detaching");
            }
        }
        for handle in state.background.drain(..) {
            handle.abort();
        }
        self.queue.shutdown();
        info!("worker pool stopped");
    }

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    /// One autoscaler decision: grow when the backlog runs five deep per
    /// worker, shrink when it falls under two per worker.
    pub async fn auto_scale_tick(self: &Arc<Self>) -> Result<(), EngineError> {
        let depth = self.queue.get_queue_depth(&self.config.topic).await?;
        let workers = self.worker_count().await;
        if workers == 0 {
            return Ok(());
        }
        if depth > (5 * workers) as u64 && workers < self.config.max_workers {
            debug!(depth, workers, "autoscale up");
            self.scale(workers + 1).await?;
        } else if depth < (2 * workers) as u64 && workers > self.config.min_workers {
            debug!(depth, workers, "autoscale down");
            self.scale(workers - 1).await?;
        }
        Ok(())
    }

    fn spawn_autoscaler(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.scale_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                if let Err(err) = pool.auto_scale_tick().await {
                    warn!(%err, "autoscale tick failed");
                }
            }
        })
    }

    /// The scavenger adopts deliveries whose consumer died mid-task: it
    /// claims PEL entries past the idle threshold and runs them through a
    /// dedicated worker.
    fn spawn_scavenger(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.claim_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                let worker = pool.make_worker("scavenger");
                match pool
                    .queue
                    .claim_pending(
                        &pool.config.topic,
                        &pool.config.consumer_group,
                        "scavenger",
                        pool.config.claim_min_idle_ms,
                        worker,
                    )
                    .await
                {
                    Ok(0) => {}
                    Ok(claimed) => info!(claimed, "scavenger adopted stale deliveries"),
                    Err(err) => warn!(%err, "scavenger claim failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, QueueConfig};
    use crate::keys::key_of;
    use crate::plan::PhaseName;
    use crate::registry::ExecutionContext;
    use crate::store::MemoryBackend;
    use crate::task::{Budget, ExecutorOutput, TaskSpec, TaskStatus, TaskType};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoRegistry;

    #[async_trait]
    impl ExecutorRegistry for EchoRegistry {
        async fn execute_agent(
            &self,
            target: &str,
            _ctx: ExecutionContext,
        ) -> anyhow::Result<ExecutorOutput> {
            Ok(ExecutorOutput {
                result: json!({"echo": target}),
                tokens_used: Some(10),
                cost_usd: None,
                artifacts: vec![],
            })
        }

        async fn execute_tool(
            &self,
            target: &str,
            ctx: ExecutionContext,
        ) -> anyhow::Result<ExecutorOutput> {
            self.execute_agent(target, ctx).await
        }
    }

    struct Fixture {
        repo: Arc<TaskRepository>,
        queue: Arc<JobQueue>,
        pool: Arc<WorkerPool>,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let repo = Arc::new(TaskRepository::open_in_memory().unwrap());
        let checkpoints =
            Arc::new(CheckpointManager::open_in_memory(CheckpointConfig::default()).unwrap());
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryBackend::new()),
            QueueConfig::default().with_block_time_ms(50),
        ));
        let config = WorkerPoolConfig {
            concurrency,
            shutdown_grace: Duration::from_millis(100),
            scale_interval: Duration::from_millis(50),
            claim_interval: Duration::from_millis(50),
            claim_min_idle_ms: 300,
            ..WorkerPoolConfig::default()
        };
        let mut pool = WorkerPool::new(
            config,
            Arc::clone(&queue),
            Arc::clone(&repo),
            checkpoints,
            Arc::new(EchoRegistry),
            Arc::new(EventBus::new()),
        );
        pool.set_heartbeat_interval(Duration::from_millis(20));
        Fixture { repo, queue, pool }
    }

    async fn enqueue_task(fixture: &Fixture, target: &str) -> i64 {
        let input = json!({"phase_id": "pr-1", "run_id": "run-1", "agent": target});
        let mut spec = TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: target.to_string(),
            idempotence_key: key_of(PhaseName::Qa, &input, "1"),
            input,
            retries: 0,
            budget: Budget { ms: 60_000, tokens: Some(100) },
        };
        let id = fixture.repo.create(&spec).unwrap();
        spec.id = Some(id);
        fixture
            .queue
            .enqueue(
                "tasks",
                &serde_json::to_value(&spec).unwrap(),
                Some(&spec.idempotence_key),
            )
            .await
            .unwrap()
            .expect("enqueued");
        id
    }

    async fn wait_for_status(repo: &TaskRepository, id: i64, status: TaskStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if repo.get_by_id(id).unwrap().unwrap().status == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task {id} never reached {status:?}"));
    }

    #[tokio::test]
    async fn test_pool_drains_tasks() {
        let fixture = fixture(2);
        let a = enqueue_task(&fixture, "agent-a").await;
        let b = enqueue_task(&fixture, "agent-b").await;

        fixture.pool.start().await.unwrap();
        wait_for_status(&fixture.repo, a, TaskStatus::Completed).await;
        wait_for_status(&fixture.repo, b, TaskStatus::Completed).await;
        fixture.pool.stop().await;

        let task = fixture.repo.get_by_id(a).unwrap().unwrap();
        assert_eq!(task.result, Some(json!({"echo": "agent-a"})));
    }

    #[tokio::test]
    async fn test_manual_scale_up_and_down() {
        let fixture = fixture(1);
        fixture.pool.start().await.unwrap();
        assert_eq!(fixture.pool.worker_count().await, 1);

        fixture.pool.scale(3).await.unwrap();
        assert_eq!(fixture.pool.worker_count().await, 3);

        fixture.pool.scale(1).await.unwrap();
        assert_eq!(fixture.pool.worker_count().await, 1);

        // A task still completes after rescaling.
        let id = enqueue_task(&fixture, "late").await;
        wait_for_status(&fixture.repo, id, TaskStatus::Completed).await;
        fixture.pool.stop().await;
    }

    #[tokio::test]
    async fn test_autoscale_tick_thresholds() {
        let fixture = fixture(1);
        fixture.pool.start().await.unwrap();

        // Deep backlog: 6 > 5 * 1 -> grow.
        for n in 0..6 {
            enqueue_task(&fixture, &format!("agent-{n}")).await;
        }
        fixture.pool.auto_scale_tick().await.unwrap();
        assert_eq!(fixture.pool.worker_count().await, 2);

        fixture.pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fixture = fixture(1);
        fixture.pool.start().await.unwrap();
        fixture.pool.stop().await;
        fixture.pool.stop().await;
    }
}
