//! Per-task heartbeat: a repository timestamp plus a TTL'd KV key, written
//! on an independent timer for the whole task lifetime.
//!
//! The heartbeat task is also the point where a worker observes external
//! status flips (cancellation, preemption): it fires the execution
//! context's cancellation token so the executor can stop at its next
//! checkpoint.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HEARTBEAT_KV_TTL_SECONDS;
use crate::repo::TaskRepository;
use crate::store::StreamBackend;
use crate::task::TaskStatus;

/// Handle for the heartbeat task of one running task.
pub struct HeartbeatHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Spawn the heartbeat loop. `cancel_executor` is fired when the task
    /// row flips to `cancelled` or `preempted` under us. Heartbeat path
    /// failures are logged and never abort the executor.
    pub fn start(
        task_id: i64,
        worker_id: String,
        repo: Arc<TaskRepository>,
        backend: Arc<dyn StreamBackend>,
        cancel_executor: CancellationToken,
        interval: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The running transition already stamped the first heartbeat.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match repo.get_by_id(task_id) {
                    Ok(Some(task)) => match task.status {
                        TaskStatus::Cancelled | TaskStatus::Preempted => {
                            debug!(
                                task_id,
                                status = task.status.as_str(),
                                "task unwound externally; signalling executor"
                            );
                            cancel_executor.cancel();
                            break;
                        }
                        _ => {}
                    },
                    Ok(None) => {
                        warn!(task_id, "task row vanished during heartbeat");
                        break;
                    }
                    Err(err) => {
                        warn!(task_id, %err, "heartbeat status check failed");
                    }
                }

                if let Err(err) = repo.update_heartbeat(task_id) {
                    warn!(task_id, %err, "heartbeat row update failed");
                }
                let key = format!("heartbeat:{task_id}");
                let value = json!({
                    "worker_id": worker_id,
                    "ts": chrono::Utc::now().to_rfc3339(),
                })
                .to_string();
                if let Err(err) =
                    backend.kv_set_ex(&key, &value, HEARTBEAT_KV_TTL_SECONDS).await
                {
                    warn!(task_id, %err, "heartbeat KV write failed");
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_of;
    use crate::plan::PhaseName;
    use crate::store::MemoryBackend;
    use crate::task::{Budget, TaskSpec, TaskType};
    use serde_json::json;

    fn running_task(repo: &TaskRepository) -> i64 {
        let input = json!({"phase_id": "pr-1"});
        let spec = TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: "qa-writer".into(),
            idempotence_key: key_of(PhaseName::Qa, &input, "1"),
            input,
            retries: 0,
            budget: Budget { ms: 60_000, tokens: None },
        };
        let id = repo.create(&spec).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("w1")).unwrap();
        id
    }

    #[tokio::test]
    async fn test_heartbeat_writes_row_and_kv() {
        let repo = Arc::new(TaskRepository::open_in_memory().unwrap());
        let backend: Arc<dyn StreamBackend> = Arc::new(MemoryBackend::new());
        let id = running_task(&repo);

        let heartbeat = HeartbeatHandle::start(
            id,
            "w1".into(),
            Arc::clone(&repo),
            Arc::clone(&backend),
            CancellationToken::new(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        heartbeat.stop().await;

        let task = repo.get_by_id(id).unwrap().unwrap();
        assert!(task.last_heartbeat_at.is_some());
        let kv = backend.kv_get(&format!("heartbeat:{id}")).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&kv).unwrap();
        assert_eq!(value["worker_id"], "w1");
    }

    #[tokio::test]
    async fn test_heartbeat_signals_cancellation() {
        let repo = Arc::new(TaskRepository::open_in_memory().unwrap());
        let backend: Arc<dyn StreamBackend> = Arc::new(MemoryBackend::new());
        let id = running_task(&repo);
        let cancel = CancellationToken::new();

        let heartbeat = HeartbeatHandle::start(
            id,
            "w1".into(),
            Arc::clone(&repo),
            backend,
            cancel.clone(),
            Duration::from_millis(20),
        );

        repo.update_status(id, TaskStatus::Cancelled, None).unwrap();
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("executor signalled");
        heartbeat.stop().await;
    }
}
