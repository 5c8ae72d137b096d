//! kiln — the execution core of a multi-phase pipeline orchestrator.
//!
//! A phase plan fans out into idempotent tasks, dispatched through a
//! durable stream queue to a pool of competing workers under heartbeat
//! and checkpoint discipline. Resource saturation preempts low-priority
//! work; a knowledge vault feeds agents ranked context packs; a typed
//! event trail records everything for gates and UIs.
//!
//! Subsystem map:
//! - [`queue`] / [`store`] — stream queue with consumer groups, dedup,
//!   and pending-entry claim over Redis Streams (or in-process).
//! - [`repo`] — durable task lifecycle, tenant ledger, preemption history.
//! - [`checkpoint`] — opaque resumption tokens for in-flight tasks.
//! - [`scheduler`] — plan → budget-split, deduplicated task specs.
//! - [`worker`] — task execution, heartbeats, pool scaling, PEL scavenge.
//! - [`priority`] — P0-P3 classes and utilization-driven preemption.
//! - [`vault`] — knowledge frames: refinery, guards, context packs.
//! - [`coordinator`] — the template engine driving one phase run.
//! - [`events`] — typed event families and the in-process bus.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod keys;
pub mod plan;
pub mod priority;
pub mod queue;
pub mod registry;
pub mod repo;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod vault;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{
    CheckpointConfig, PreemptionConfig, QueueConfig, VaultConfig, WorkerPoolConfig,
};
pub use coordinator::{PhaseCoordinator, PhaseDriver, PhaseRunConfig};
pub use errors::{EngineError, QueueError, VaultError};
pub use events::{Event, EventBus, EventPayload};
pub use plan::{Parallelism, PhaseName, PhasePlan, PlanBudgets};
pub use priority::PriorityScheduler;
pub use queue::{JobQueue, MessageHandler, QueueMessage};
pub use registry::{ExecutionContext, ExecutorRegistry};
pub use repo::TaskRepository;
pub use scheduler::{ScheduleContext, ScheduleResult, Scheduler};
pub use task::{
    Budget, ExecutorOutput, PriorityClass, Task, TaskOutcome, TaskSpec, TaskStatus, TaskType,
};
pub use vault::MemoryVault;
pub use worker::{Worker, WorkerPool};
