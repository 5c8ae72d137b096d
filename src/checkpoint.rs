//! Checkpoint manager: opaque resumption tokens for in-flight tasks.
//!
//! One live checkpoint per task, upserted at whatever cadence the executor
//! chooses through the curried callback, deleted on successful completion,
//! retained across failed attempts so the next attempt resumes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use crate::config::CheckpointConfig;
use crate::errors::EngineError;
use crate::repo::migrations::{self, Migration};

const CHECKPOINT_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "create-checkpoints",
    sql: "
        CREATE TABLE checkpoints (
            task_id INTEGER PRIMARY KEY,
            token TEXT NOT NULL,
            data TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
    ",
}];

/// A stored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub task_id: i64,
    pub token: String,
    pub data: Value,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
}

/// Executors receive this curried save handle; calling it persists a new
/// checkpoint for the owning task.
pub type CheckpointFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// SQLite-backed checkpoint store.
pub struct CheckpointManager {
    conn: Mutex<Connection>,
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn open(path: &Path, config: CheckpointConfig) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open checkpoint database")?;
        Self::init(conn, config)
    }

    pub fn open_in_memory(config: CheckpointConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory checkpoint database")?;
        Self::init(conn, config)
    }

    fn init(mut conn: Connection, config: CheckpointConfig) -> Result<Self> {
        migrations::apply(&mut conn, CHECKPOINT_MIGRATIONS)
            .context("Failed to run checkpoint migrations")?;
        Ok(Self { conn: Mutex::new(conn), config })
    }

    /// Upsert the checkpoint for a task. The blob is size-capped; an
    /// oversized checkpoint is rejected rather than truncated.
    pub fn save_checkpoint(
        &self,
        task_id: i64,
        token: &str,
        data: &Value,
    ) -> Result<(), EngineError> {
        let blob = data.to_string();
        if blob.len() > self.config.max_bytes {
            return Err(EngineError::CheckpointTooLarge {
                task_id,
                size: blob.len(),
                cap: self.config.max_bytes,
            });
        }
        let conn = self.conn.lock().expect("checkpoint lock");
        conn.execute(
            "INSERT INTO checkpoints (task_id, token, data, size_bytes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(task_id) DO UPDATE SET token = excluded.token, \
             data = excluded.data, size_bytes = excluded.size_bytes, \
             created_at = excluded.created_at",
            params![task_id, token, blob, blob.len() as i64, Utc::now().timestamp_millis()],
        )
        .map_err(|err| EngineError::Database(anyhow!(err).context("Failed to save checkpoint")))?;
        Ok(())
    }

    pub fn load_checkpoint(&self, task_id: i64) -> Result<Option<Checkpoint>, EngineError> {
        let conn = self.conn.lock().expect("checkpoint lock");
        conn.query_row(
            "SELECT task_id, token, data, size_bytes, created_at \
             FROM checkpoints WHERE task_id = ?1",
            params![task_id],
            |row| {
                let data: String = row.get(2)?;
                let created_ms: i64 = row.get(4)?;
                Ok(Checkpoint {
                    task_id: row.get(0)?,
                    token: row.get(1)?,
                    data: serde_json::from_str(&data).unwrap_or(Value::Null),
                    size_bytes: row.get::<_, i64>(3)? as usize,
                    created_at: Utc
                        .timestamp_millis_opt(created_ms)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            },
        )
        .optional()
        .map_err(|err| EngineError::Database(anyhow!(err).context("Failed to load checkpoint")))
    }

    /// Delete the task's checkpoint. Idempotent.
    pub fn delete_checkpoint(&self, task_id: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("checkpoint lock");
        conn.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])
            .map_err(|err| {
                EngineError::Database(anyhow!(err).context("Failed to delete checkpoint"))
            })?;
        Ok(())
    }

    /// Curried save handle for one task. Failures are logged, never
    /// surfaced to the executor: checkpointing is best-effort progress
    /// capture, not part of the executor's contract.
    pub fn checkpoint_callback(self: &Arc<Self>, task_id: i64) -> CheckpointFn {
        let manager = Arc::clone(self);
        Arc::new(move |token: &str, data: &Value| {
            if let Err(err) = manager.save_checkpoint(task_id, token, data) {
                warn!(task_id, %err, "checkpoint save failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> Arc<CheckpointManager> {
        Arc::new(CheckpointManager::open_in_memory(CheckpointConfig::default()).unwrap())
    }

    #[test]
    fn test_save_load_round_trip() {
        let manager = manager();
        manager.save_checkpoint(1, "step-2", &json!({"progress": 50})).unwrap();
        let checkpoint = manager.load_checkpoint(1).unwrap().unwrap();
        assert_eq!(checkpoint.token, "step-2");
        assert_eq!(checkpoint.data, json!({"progress": 50}));
        assert_eq!(checkpoint.size_bytes, json!({"progress": 50}).to_string().len());
    }

    #[test]
    fn test_save_is_upsert() {
        let manager = manager();
        manager.save_checkpoint(1, "step-1", &json!({"progress": 10})).unwrap();
        manager.save_checkpoint(1, "step-2", &json!({"progress": 80})).unwrap();
        let checkpoint = manager.load_checkpoint(1).unwrap().unwrap();
        assert_eq!(checkpoint.token, "step-2");
        assert_eq!(checkpoint.data["progress"], 80);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let manager = manager();
        manager.save_checkpoint(1, "t", &json!({})).unwrap();
        manager.delete_checkpoint(1).unwrap();
        manager.delete_checkpoint(1).unwrap();
        assert!(manager.load_checkpoint(1).unwrap().is_none());
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let manager = Arc::new(
            CheckpointManager::open_in_memory(CheckpointConfig { max_bytes: 16 }).unwrap(),
        );
        let err = manager
            .save_checkpoint(1, "t", &json!({"blob": "far too large for the cap"}))
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointTooLarge { .. }));
        assert!(manager.load_checkpoint(1).unwrap().is_none());
    }

    #[test]
    fn test_callback_saves_for_owner_task() {
        let manager = manager();
        let callback = manager.checkpoint_callback(7);
        callback("mid", &json!({"step": 3}));
        let checkpoint = manager.load_checkpoint(7).unwrap().unwrap();
        assert_eq!(checkpoint.task_id, 7);
        assert_eq!(checkpoint.token, "mid");
    }
}
