//! Executor registry seam.
//!
//! The engine never runs agents or tools itself; it resolves a target name
//! through this trait and hands over an execution context. Implementations
//! live outside the engine (LLM agent shells, tool sandboxes).

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointFn;
use crate::task::{Budget, ExecutorOutput};

/// Everything an executor gets for one attempt.
///
/// `checkpoint`/`checkpoint_data` carry the last saved resumption point,
/// if any. The executor may call `save_checkpoint` at natural progress
/// points, and must wind down at its next checkpoint once `cancelled`
/// fires (cancellation or preemption).
pub struct ExecutionContext {
    pub input: Value,
    pub checkpoint: Option<String>,
    pub checkpoint_data: Option<Value>,
    pub save_checkpoint: CheckpointFn,
    pub cancelled: CancellationToken,
    pub budget: Budget,
}

/// Resolves executor targets by name.
#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    async fn execute_agent(
        &self,
        target: &str,
        ctx: ExecutionContext,
    ) -> anyhow::Result<ExecutorOutput>;

    async fn execute_tool(
        &self,
        target: &str,
        ctx: ExecutionContext,
    ) -> anyhow::Result<ExecutorOutput>;
}
