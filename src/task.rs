//! Task data model: the scheduling unit and its durable lifecycle record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::PhaseName;

/// What kind of executor a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Agent,
    Tool,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Per-task budget slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Wall-clock budget in milliseconds. Advisory; enforced by executor
    /// cooperation.
    pub ms: u64,
    /// Token budget, when the plan carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// The unit of scheduling. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Durable task identifier; set by the repository on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub phase: PhaseName,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Executor name the registry resolves.
    pub target: String,
    /// Opaque key/value map: phase inputs, rubrics, budget slice, shard
    /// metadata.
    pub input: Value,
    /// Attempt counter.
    #[serde(default)]
    pub retries: u32,
    pub budget: Budget,
    /// `{PHASE}:{16-hex}`, derived by [`crate::keys::key_of`].
    pub idempotence_key: String,
}

impl TaskSpec {
    /// The durable id, if the spec has been inserted.
    pub fn id(&self) -> Option<i64> {
        self.id
    }
}

/// Lifecycle states of a durable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Preempted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Preempted => "preempted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "preempted" => Some(Self::Preempted),
            _ => None,
        }
    }

    /// Terminal states set `completed_at` and free the worker slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Priority classes, P0 highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityClass {
    P0,
    P1,
    P2,
    P3,
}

impl PriorityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            _ => None,
        }
    }

    /// P0 tasks are never preempted.
    pub fn is_preemptible(&self) -> bool {
        *self != Self::P0
    }
}

/// The durable record of a task: its spec plus lifecycle, metrics, worker
/// assignment, and preemption history summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Identifier of the phase run this task belongs to, lifted from
    /// `input.phase_id` at insert time.
    pub phase_run_id: String,
    pub phase: PhaseName,
    pub task_type: TaskType,
    pub target: String,
    pub input: Value,
    pub retries: u32,
    pub budget: Budget,
    pub idempotence_key: String,

    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub result: Option<Value>,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
    pub tokens_used: Option<u64>,
    pub duration_ms: Option<u64>,

    pub priority_class: PriorityClass,
    pub preempted: bool,
    pub preemption_reason: Option<String>,
    pub preempted_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub preemption_count: u32,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Rebuild the immutable spec from the durable record, id included.
    pub fn to_spec(&self) -> TaskSpec {
        TaskSpec {
            id: Some(self.id),
            phase: self.phase,
            task_type: self.task_type,
            target: self.target.clone(),
            input: self.input.clone(),
            retries: self.retries,
            budget: self.budget,
            idempotence_key: self.idempotence_key.clone(),
        }
    }
}

/// Final metrics for a finished attempt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Typed outcome of a single task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        result: Value,
        metrics: TaskMetrics,
    },
    Failed {
        error: String,
        /// Attempts consumed so far, including this one.
        retries: u32,
        #[serde(default)]
        duration_ms: u64,
    },
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Completed { metrics, .. } => metrics.duration_ms,
            Self::Failed { duration_ms, .. } => *duration_ms,
        }
    }
}

/// What an executor hands back to the worker. `result` is opaque to the
/// engine; token and cost figures feed task metrics when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}
