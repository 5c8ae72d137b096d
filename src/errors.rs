//! Typed error hierarchy for the kiln engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `QueueError` — stream/KV backend and consume-loop failures
//! - `EngineError` — scheduler, worker, pool, and preemption failures
//! - `VaultError` — knowledge frame ingest, guard, and query failures

use thiserror::Error;

/// Errors from the durable stream queue and its KV side-channel.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed stream payload on topic {topic}: {message}")]
    Payload { topic: String, message: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Queue is shut down")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from scheduling, execution, and preemption.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Executor target '{target}' is not registered")]
    ExecutorNotFound { target: String },

    #[error("Checkpoint for task {task_id} is {size} bytes, cap is {cap}")]
    CheckpointTooLarge { task_id: i64, size: usize, cap: usize },

    #[error("Priority for task {id} is already assigned and not overridable")]
    PriorityLocked { id: i64 },

    #[error("Exceeded max preemptions ({max})")]
    MaxPreemptions { max: u32 },

    #[error("Phase plan has no agents")]
    EmptyPlan,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the memory vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Frame {id} not found")]
    FrameNotFound { id: String },

    #[error("Frame rejected: no claims")]
    EmptyClaims,

    #[error("Frame rejected: no citations")]
    NoCitations,

    #[error("Frame rejected: {reason}")]
    Ungrounded { reason: String },

    #[error("Frame contradicts existing knowledge on theme '{theme}'")]
    Contradiction { theme: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_max_preemptions_message() {
        let err = EngineError::MaxPreemptions { max: 3 };
        assert_eq!(err.to_string(), "Exceeded max preemptions (3)");
    }

    #[test]
    fn engine_error_converts_from_queue_error() {
        let inner = QueueError::Closed;
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Queue(QueueError::Closed)));
    }

    #[test]
    fn vault_error_variants_are_distinct() {
        let a = VaultError::EmptyClaims;
        let b = VaultError::NoCitations;
        assert!(matches!(a, VaultError::EmptyClaims));
        assert!(!matches!(b, VaultError::EmptyClaims));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&QueueError::Closed);
        assert_std_error(&EngineError::TaskNotFound { id: 1 });
        assert_std_error(&VaultError::EmptyClaims);
    }
}
