//! Durable task repository over SQLite.
//!
//! The task row is the canonical source of truth for a task's lifecycle.
//! Workers mutate only rows they own (matched by `worker_id`); individual
//! updates are single-row atomic writes, and the coupled preemption writes
//! (task row + history row) run in one transaction.

pub mod migrations;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::plan::PhaseName;
use crate::task::{Budget, PriorityClass, Task, TaskMetrics, TaskSpec, TaskStatus, TaskType};
use migrations::Migration;

const ENGINE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create-task-tables",
        sql: "
            CREATE TABLE tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phase_run_id TEXT NOT NULL DEFAULT '',
                phase TEXT NOT NULL,
                task_type TEXT NOT NULL,
                target TEXT NOT NULL,
                input TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                budget_ms INTEGER NOT NULL,
                budget_tokens INTEGER,
                idempotence_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                worker_id TEXT,
                started_at INTEGER,
                completed_at INTEGER,
                last_heartbeat_at INTEGER,
                result TEXT,
                error TEXT,
                cost_usd REAL,
                tokens_used INTEGER,
                duration_ms INTEGER,
                priority_class TEXT NOT NULL DEFAULT 'P2',
                priority_reason TEXT,
                priority_overridable INTEGER NOT NULL DEFAULT 1,
                priority_assigned INTEGER NOT NULL DEFAULT 0,
                preempted INTEGER NOT NULL DEFAULT 0,
                preemption_reason TEXT,
                preempted_at INTEGER,
                resumed_at INTEGER,
                preemption_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE preemption_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                reason TEXT NOT NULL,
                resource TEXT,
                preempted_at INTEGER NOT NULL,
                resumed_at INTEGER
            );

            CREATE INDEX idx_tasks_phase_run ON tasks(phase_run_id, status);
            CREATE INDEX idx_tasks_status ON tasks(status);
            CREATE INDEX idx_tasks_idempotence ON tasks(idempotence_key);
            CREATE INDEX idx_preemption_history_task ON preemption_history(task_id);
        ",
    },
    Migration {
        version: 2,
        name: "create-tenant-ledger",
        sql: "
            CREATE TABLE tenant_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                amount REAL NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE TABLE tenant_quotas (
                tenant_id TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                max_amount REAL NOT NULL,
                PRIMARY KEY (tenant_id, resource_type)
            );

            CREATE INDEX idx_tenant_usage_window
                ON tenant_usage(resource_type, recorded_at);
        ",
    },
];

const TASK_COLUMNS: &str = "id, phase_run_id, phase, task_type, target, input, retries, \
     budget_ms, budget_tokens, idempotence_key, status, worker_id, started_at, completed_at, \
     last_heartbeat_at, result, error, cost_usd, tokens_used, duration_ms, priority_class, \
     priority_reason, priority_overridable, priority_assigned, preempted, preemption_reason, \
     preempted_at, resumed_at, preemption_count, created_at";

/// Aggregate counters for one phase run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub preempted: usize,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub avg_duration_ms: f64,
}

/// A persisted priority assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityAssignment {
    pub class: PriorityClass,
    pub reason: Option<String>,
    pub overridable: bool,
}

/// SQLite-backed store of every task's lifecycle.
pub struct TaskRepository {
    conn: Mutex<Connection>,
}

impl TaskRepository {
    /// Open (or create) the engine database at the given path and run
    /// migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open task database")?;
        Self::init(conn)
    }

    /// Open an in-memory database (for tests and embedded use).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory task database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        migrations::apply(&mut conn, ENGINE_MIGRATIONS).context("Failed to run migrations")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("task repository lock")
    }

    // ── Task lifecycle ────────────────────────────────────────────────

    /// Insert a pending task and return its durable id.
    pub fn create(&self, spec: &TaskSpec) -> Result<i64> {
        let phase_run_id = spec
            .input
            .get("phase_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (phase_run_id, phase, task_type, target, input, retries, \
             budget_ms, budget_tokens, idempotence_key, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                phase_run_id,
                spec.phase.as_str(),
                spec.task_type.as_str(),
                spec.target,
                spec.input.to_string(),
                spec.retries,
                spec.budget.ms as i64,
                spec.budget.tokens.map(|t| t as i64),
                spec.idempotence_key,
                now_ms(),
            ],
        )
        .context("Failed to insert task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .context("Failed to prepare get_by_id")?;
        stmt.query_row(params![id], row_to_task)
            .optional()
            .context("Failed to query task")
    }

    /// Transition a task's status. Moving to `running` stamps `started_at`,
    /// the worker assignment, and the first heartbeat; terminal states
    /// stamp `completed_at`.
    pub fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        worker_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        let now = now_ms();
        let changed = match status {
            TaskStatus::Running => conn.execute(
                "UPDATE tasks SET status = ?1, worker_id = ?2, started_at = ?3, \
                 last_heartbeat_at = ?3 WHERE id = ?4",
                params![status.as_str(), worker_id, now, id],
            ),
            _ if status.is_terminal() => conn.execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2, preempted = 0 WHERE id = ?3",
                params![status.as_str(), now, id],
            ),
            _ => conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            ),
        }
        .context("Failed to update task status")?;
        anyhow::ensure!(changed == 1, "Task {id} not found");
        Ok(())
    }

    pub fn update_heartbeat(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )
        .context("Failed to update heartbeat")?;
        Ok(())
    }

    /// Record a successful attempt with its final metrics.
    pub fn complete(&self, id: i64, result: &Value, metrics: TaskMetrics) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1, result = ?2, \
                 cost_usd = ?3, tokens_used = ?4, duration_ms = ?5, preempted = 0 WHERE id = ?6",
                params![
                    now_ms(),
                    result.to_string(),
                    metrics.cost_usd,
                    metrics.tokens_used.map(|t| t as i64),
                    metrics.duration_ms as i64,
                    id
                ],
            )
            .context("Failed to complete task")?;
        anyhow::ensure!(changed == 1, "Task {id} not found");
        Ok(())
    }

    /// Record a failed attempt and the consumed retry count.
    pub fn fail(&self, id: i64, error: &str, retries: u32) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?1, error = ?2, \
                 retries = ?3, preempted = 0 WHERE id = ?4",
                params![now_ms(), error, retries, id],
            )
            .context("Failed to fail task")?;
        anyhow::ensure!(changed == 1, "Task {id} not found");
        Ok(())
    }

    pub fn get_by_phase(
        &self,
        phase_run_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let conn = self.lock();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks \
                         WHERE phase_run_id = ?1 AND status = ?2 ORDER BY id"
                    ))
                    .context("Failed to prepare get_by_phase")?;
                collect_tasks(stmt.query_map(params![phase_run_id, status.as_str()], row_to_task))
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE phase_run_id = ?1 ORDER BY id"
                    ))
                    .context("Failed to prepare get_by_phase")?;
                collect_tasks(stmt.query_map(params![phase_run_id], row_to_task))
            }
        }
    }

    /// Running tasks whose last heartbeat is older than `idle_seconds`.
    pub fn get_stalled_tasks(&self, idle_seconds: u64) -> Result<Vec<Task>> {
        let conn = self.lock();
        let cutoff = now_ms() - (idle_seconds as i64) * 1_000;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'running' AND last_heartbeat_at < ?1 ORDER BY last_heartbeat_at"
            ))
            .context("Failed to prepare get_stalled_tasks")?;
        collect_tasks(stmt.query_map(params![cutoff], row_to_task))
    }

    /// All currently running tasks (preemption candidate pool).
    pub fn get_running(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' ORDER BY started_at"
            ))
            .context("Failed to prepare get_running")?;
        collect_tasks(stmt.query_map([], row_to_task))
    }

    pub fn get_stats_by_phase(&self, phase_run_id: &str) -> Result<PhaseStats> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(cost_usd), 0), \
                 COALESCE(SUM(tokens_used), 0), COALESCE(AVG(duration_ms), 0) \
                 FROM tasks WHERE phase_run_id = ?1 GROUP BY status",
            )
            .context("Failed to prepare get_stats_by_phase")?;
        let rows = stmt
            .query_map(params![phase_run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })
            .context("Failed to query phase stats")?;

        let mut stats = PhaseStats::default();
        let mut duration_weight = 0.0;
        let mut duration_sum = 0.0;
        for row in rows {
            let (status, count, cost, tokens, avg_duration) =
                row.context("Failed to read stats row")?;
            let count = count as usize;
            stats.total += count;
            stats.total_cost_usd += cost;
            stats.total_tokens += tokens as u64;
            if avg_duration > 0.0 {
                duration_sum += avg_duration * count as f64;
                duration_weight += count as f64;
            }
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::Running) => stats.running = count,
                Some(TaskStatus::Completed) => stats.completed = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                Some(TaskStatus::Cancelled) => stats.cancelled = count,
                Some(TaskStatus::Preempted) => stats.preempted = count,
                None => {}
            }
        }
        if duration_weight > 0.0 {
            stats.avg_duration_ms = duration_sum / duration_weight;
        }
        Ok(stats)
    }

    /// Flip every pending or running task of a phase run to `cancelled`.
    /// Returns the number of tasks cancelled.
    pub fn cancel_phase(&self, phase_run_id: &str) -> Result<usize> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?1, preempted = 0 \
             WHERE phase_run_id = ?2 AND status IN ('pending', 'running')",
            params![now_ms(), phase_run_id],
        )
        .context("Failed to cancel phase")
    }

    // ── Priority ──────────────────────────────────────────────────────

    pub fn get_priority(&self, id: i64) -> Result<Option<PriorityAssignment>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT priority_class, priority_reason, priority_overridable, priority_assigned \
             FROM tasks WHERE id = ?1",
            params![id],
            |row| {
                let class: String = row.get(0)?;
                let reason: Option<String> = row.get(1)?;
                let overridable: bool = row.get(2)?;
                let assigned: bool = row.get(3)?;
                Ok(assigned.then(|| PriorityAssignment {
                    class: PriorityClass::parse(&class).unwrap_or(PriorityClass::P2),
                    reason,
                    overridable,
                }))
            },
        )
        .optional()
        .context("Failed to query priority")
        .map(Option::flatten)
    }

    /// The effective class for scheduling decisions: the assignment if one
    /// exists, otherwise the default P2.
    pub fn effective_priority(&self, id: i64) -> Result<PriorityClass> {
        let conn = self.lock();
        let class: Option<String> = conn
            .query_row(
                "SELECT priority_class FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query priority class")?;
        Ok(class
            .and_then(|c| PriorityClass::parse(&c))
            .unwrap_or(PriorityClass::P2))
    }

    pub fn set_priority(&self, id: i64, assignment: &PriorityAssignment) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE tasks SET priority_class = ?1, priority_reason = ?2, \
                 priority_overridable = ?3, priority_assigned = 1 WHERE id = ?4",
                params![
                    assignment.class.as_str(),
                    assignment.reason,
                    assignment.overridable,
                    id
                ],
            )
            .context("Failed to set priority")?;
        anyhow::ensure!(changed == 1, "Task {id} not found");
        Ok(())
    }

    // ── Preemption ────────────────────────────────────────────────────

    pub fn preemption_count(&self, id: i64) -> Result<u32> {
        let conn = self.lock();
        conn.query_row(
            "SELECT preemption_count FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to query preemption count")
    }

    /// Atomically mark a task preempted and append its history row.
    pub fn mark_preempted(&self, id: i64, reason: &str, resource: Option<&str>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin preemption")?;
        let now = now_ms();
        let changed = tx
            .execute(
                "UPDATE tasks SET preempted = 1, preemption_reason = ?1, preempted_at = ?2, \
                 preemption_count = preemption_count + 1, status = 'preempted' WHERE id = ?3",
                params![reason, now, id],
            )
            .context("Failed to mark task preempted")?;
        anyhow::ensure!(changed == 1, "Task {id} not found");
        tx.execute(
            "INSERT INTO preemption_history (task_id, reason, resource, preempted_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![id, reason, resource, now],
        )
        .context("Failed to insert preemption history")?;
        tx.commit().context("Failed to commit preemption")
    }

    /// Atomically return a preempted task to `pending` and stamp the most
    /// recent history row.
    pub fn mark_resumed(&self, id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin resume")?;
        let now = now_ms();
        let changed = tx
            .execute(
                "UPDATE tasks SET preempted = 0, status = 'pending', resumed_at = ?1 \
                 WHERE id = ?2 AND status = 'preempted'",
                params![now, id],
            )
            .context("Failed to mark task resumed")?;
        anyhow::ensure!(changed == 1, "Task {id} is not preempted");
        tx.execute(
            "UPDATE preemption_history SET resumed_at = ?1 WHERE id = \
             (SELECT id FROM preemption_history WHERE task_id = ?2 \
              ORDER BY preempted_at DESC, id DESC LIMIT 1)",
            params![now, id],
        )
        .context("Failed to stamp preemption history")?;
        tx.commit().context("Failed to commit resume")
    }

    /// Preemption history rows for a task, newest first.
    pub fn preemption_history(&self, id: i64) -> Result<Vec<(String, Option<i64>)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT reason, resumed_at FROM preemption_history \
                 WHERE task_id = ?1 ORDER BY preempted_at DESC, id DESC",
            )
            .context("Failed to prepare preemption_history")?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query preemption history")?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.context("Failed to read history row")?);
        }
        Ok(history)
    }

    // ── Tenant ledger ─────────────────────────────────────────────────

    pub fn record_usage(&self, tenant_id: &str, resource_type: &str, amount: f64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tenant_usage (tenant_id, resource_type, amount, recorded_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, resource_type, amount, now_ms()],
        )
        .context("Failed to record usage")?;
        Ok(())
    }

    pub fn set_quota(&self, tenant_id: &str, resource_type: &str, max_amount: f64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tenant_quotas (tenant_id, resource_type, max_amount) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(tenant_id, resource_type) DO UPDATE SET max_amount = excluded.max_amount",
            params![tenant_id, resource_type, max_amount],
        )
        .context("Failed to set quota")?;
        Ok(())
    }

    /// Sum of usage for a resource within the trailing window.
    pub fn usage_in_window(&self, resource_type: &str, window: Duration) -> Result<f64> {
        let conn = self.lock();
        let cutoff = now_ms() - window.as_millis() as i64;
        conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM tenant_usage \
             WHERE resource_type = ?1 AND recorded_at >= ?2",
            params![resource_type, cutoff],
            |row| row.get(0),
        )
        .context("Failed to sum usage window")
    }

    /// Total quota capacity for a resource across tenants, if any quotas
    /// are registered.
    pub fn quota_total(&self, resource_type: &str) -> Result<Option<f64>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT SUM(max_amount) FROM tenant_quotas WHERE resource_type = ?1",
            params![resource_type],
            |row| row.get::<_, Option<f64>>(0),
        )
        .context("Failed to sum quotas")
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn collect_tasks(
    rows: rusqlite::Result<impl Iterator<Item = rusqlite::Result<Task>>>,
) -> Result<Vec<Task>> {
    let rows = rows.context("Failed to query tasks")?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("Failed to read task row")?);
    }
    Ok(tasks)
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let phase: String = row.get(2)?;
    let task_type: String = row.get(3)?;
    let input: String = row.get(5)?;
    let status: String = row.get(10)?;
    let result: Option<String> = row.get(15)?;
    let priority: String = row.get(20)?;
    Ok(Task {
        id: row.get(0)?,
        phase_run_id: row.get(1)?,
        phase: PhaseName::parse(&phase).unwrap_or(PhaseName::Intake),
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Agent),
        target: row.get(4)?,
        input: serde_json::from_str(&input).unwrap_or(Value::Null),
        retries: row.get(6)?,
        budget: Budget {
            ms: row.get::<_, i64>(7)? as u64,
            tokens: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
        },
        idempotence_key: row.get(9)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        worker_id: row.get(11)?,
        started_at: ms_to_datetime(row.get(12)?),
        completed_at: ms_to_datetime(row.get(13)?),
        last_heartbeat_at: ms_to_datetime(row.get(14)?),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get(16)?,
        cost_usd: row.get(17)?,
        tokens_used: row.get::<_, Option<i64>>(18)?.map(|t| t as u64),
        duration_ms: row.get::<_, Option<i64>>(19)?.map(|d| d as u64),
        priority_class: PriorityClass::parse(&priority).unwrap_or(PriorityClass::P2),
        preempted: row.get(24)?,
        preemption_reason: row.get(25)?,
        preempted_at: ms_to_datetime(row.get(26)?),
        resumed_at: ms_to_datetime(row.get(27)?),
        preemption_count: row.get(28)?,
        created_at: ms_to_datetime(row.get(29)?).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_of;
    use serde_json::json;

    fn spec(target: &str, phase_run_id: &str) -> TaskSpec {
        let input = json!({"phase_id": phase_run_id, "story": "S1"});
        TaskSpec {
            id: None,
            phase: PhaseName::Qa,
            task_type: TaskType::Agent,
            target: target.to_string(),
            idempotence_key: key_of(PhaseName::Qa, &input, "1"),
            input,
            retries: 0,
            budget: Budget { ms: 60_000, tokens: Some(1_000) },
        }
    }

    #[test]
    fn test_create_and_fetch() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("qa-writer", "pr-1")).unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.phase_run_id, "pr-1");
        assert_eq!(task.target, "qa-writer");
        assert_eq!(task.budget.tokens, Some(1_000));
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn test_running_transition_stamps_worker_and_start() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("qa-writer", "pr-1")).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("worker-1")).unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
        assert!(task.started_at.is_some());
        assert!(task.last_heartbeat_at.is_some());
    }

    #[test]
    fn test_complete_stamps_metrics_and_terminal_time() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("qa-writer", "pr-1")).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("worker-1")).unwrap();
        repo.complete(
            id,
            &json!({"answer": 42}),
            TaskMetrics { duration_ms: 1_200, tokens_used: Some(700), cost_usd: Some(0.007) },
        )
        .unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.tokens_used, Some(700));
        assert_eq!(task.duration_ms, Some(1_200));
        assert_eq!(task.result, Some(json!({"answer": 42})));
    }

    #[test]
    fn test_fail_records_error_and_retries() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("qa-writer", "pr-1")).unwrap();
        repo.fail(id, "executor blew up", 2).unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("executor blew up"));
        assert_eq!(task.retries, 2);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_get_by_phase_filters_status() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let a = repo.create(&spec("a", "pr-1")).unwrap();
        let _b = repo.create(&spec("b", "pr-1")).unwrap();
        let _other = repo.create(&spec("c", "pr-2")).unwrap();
        repo.update_status(a, TaskStatus::Running, Some("w1")).unwrap();

        assert_eq!(repo.get_by_phase("pr-1", None).unwrap().len(), 2);
        let running = repo.get_by_phase("pr-1", Some(TaskStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a);
    }

    #[test]
    fn test_stalled_detection_uses_heartbeat_age() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("a", "pr-1")).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("w1")).unwrap();

        // Fresh heartbeat: not stalled even at zero tolerance after
        // backdating is skipped.
        assert!(repo.get_stalled_tasks(60).unwrap().is_empty());

        // Backdate the heartbeat two minutes.
        {
            let conn = repo.lock();
            conn.execute(
                "UPDATE tasks SET last_heartbeat_at = ?1 WHERE id = ?2",
                params![now_ms() - 120_000, id],
            )
            .unwrap();
        }
        let stalled = repo.get_stalled_tasks(60).unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, id);
    }

    #[test]
    fn test_cancel_phase_flips_pending_and_running() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let a = repo.create(&spec("a", "pr-1")).unwrap();
        let b = repo.create(&spec("b", "pr-1")).unwrap();
        let c = repo.create(&spec("c", "pr-1")).unwrap();
        repo.update_status(a, TaskStatus::Running, Some("w1")).unwrap();
        repo.complete(c, &json!({}), TaskMetrics::default()).unwrap();

        assert_eq!(repo.cancel_phase("pr-1").unwrap(), 2);
        assert_eq!(repo.get_by_id(a).unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(repo.get_by_id(b).unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(repo.get_by_id(c).unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_preemption_round_trip() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("a", "pr-1")).unwrap();
        repo.update_status(id, TaskStatus::Running, Some("w1")).unwrap();

        repo.mark_preempted(id, "cpu over threshold", Some("cpu")).unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Preempted);
        assert!(task.preempted);
        assert!(task.preempted_at.is_some());
        assert_eq!(task.preemption_count, 1);

        repo.mark_resumed(id).unwrap();
        let task = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.preempted);
        assert!(task.resumed_at.is_some());
        assert_eq!(task.preemption_count, 1);

        let history = repo.preemption_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].1.is_some());
    }

    #[test]
    fn test_resume_requires_preempted_state() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("a", "pr-1")).unwrap();
        assert!(repo.mark_resumed(id).is_err());
    }

    #[test]
    fn test_priority_assignment_round_trip() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let id = repo.create(&spec("a", "pr-1")).unwrap();
        assert!(repo.get_priority(id).unwrap().is_none());
        assert_eq!(repo.effective_priority(id).unwrap(), PriorityClass::P2);

        let assignment = PriorityAssignment {
            class: PriorityClass::P1,
            reason: Some("interactive run".into()),
            overridable: false,
        };
        repo.set_priority(id, &assignment).unwrap();
        assert_eq!(repo.get_priority(id).unwrap(), Some(assignment));
        assert_eq!(repo.effective_priority(id).unwrap(), PriorityClass::P1);
    }

    #[test]
    fn test_stats_aggregate_by_status() {
        let repo = TaskRepository::open_in_memory().unwrap();
        let a = repo.create(&spec("a", "pr-1")).unwrap();
        let _b = repo.create(&spec("b", "pr-1")).unwrap();
        repo.update_status(a, TaskStatus::Running, Some("w1")).unwrap();
        repo.complete(
            a,
            &json!({}),
            TaskMetrics { duration_ms: 1_000, tokens_used: Some(500), cost_usd: Some(0.005) },
        )
        .unwrap();

        let stats = repo.get_stats_by_phase("pr-1").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_tokens, 500);
        assert!((stats.total_cost_usd - 0.005).abs() < 1e-9);
        assert!(stats.avg_duration_ms > 0.0);
    }

    #[test]
    fn test_open_reuses_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let id = {
            let repo = TaskRepository::open(&path).unwrap();
            repo.create(&spec("qa-writer", "pr-1")).unwrap()
        };

        let reopened = TaskRepository::open(&path).unwrap();
        let task = reopened.get_by_id(id).unwrap().unwrap();
        assert_eq!(task.target, "qa-writer");
    }

    #[test]
    fn test_tenant_ledger_window() {
        let repo = TaskRepository::open_in_memory().unwrap();
        repo.set_quota("acme", "cpu", 8.0).unwrap();
        repo.set_quota("globex", "cpu", 8.0).unwrap();
        repo.record_usage("acme", "cpu", 4.0).unwrap();
        repo.record_usage("globex", "cpu", 8.0).unwrap();

        let used = repo.usage_in_window("cpu", Duration::from_secs(300)).unwrap();
        assert!((used - 12.0).abs() < 1e-9);
        assert_eq!(repo.quota_total("cpu").unwrap(), Some(16.0));
        assert_eq!(repo.quota_total("gpu").unwrap(), None);

        // Quota upsert replaces.
        repo.set_quota("acme", "cpu", 16.0).unwrap();
        assert_eq!(repo.quota_total("cpu").unwrap(), Some(24.0));
    }
}
