//! The phase driver capability set.
//!
//! Concrete phases differ only in how they pick agents, shape inputs,
//! aggregate results, and react to gate feedback; the coordinator engine
//! is closed over this trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::task::ExecutorOutput;

use super::gate::{GateEvaluationInput, GateHint};

/// One agent's run within a phase attempt.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub agent: String,
    pub output: Option<ExecutorOutput>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AgentRun {
    pub fn succeeded(&self) -> bool {
        self.output.is_some()
    }
}

/// What a concrete phase plugs into the coordinator.
#[async_trait]
pub trait PhaseDriver: Send + Sync {
    /// Executor targets to run for this phase attempt.
    async fn initialize_agents(&self) -> anyhow::Result<Vec<String>>;

    /// Build one agent's input from the phase input.
    async fn prepare_agent_input(
        &self,
        agent: &str,
        phase_input: &Value,
    ) -> anyhow::Result<Value>;

    /// Combine agent results into artifact identifiers.
    async fn aggregate_results(
        &self,
        successes: &[AgentRun],
        failures: &[AgentRun],
        phase_input: &Value,
    ) -> anyhow::Result<Vec<String>>;

    /// Build the gate evaluation input for this attempt's artifacts.
    async fn prepare_gate_input(
        &self,
        artifacts: &[String],
        phase_input: &Value,
    ) -> anyhow::Result<GateEvaluationInput> {
        Ok(GateEvaluationInput {
            artifacts: artifacts.to_vec(),
            rubrics: phase_input.get("rubrics").cloned().unwrap_or(Value::Null),
            metrics: Value::Null,
        })
    }

    /// Fold gate hints into the input for the next attempt. The default
    /// attaches them under `gate_hints`.
    async fn enhance_input_with_hints(
        &self,
        phase_input: &Value,
        hints: &[GateHint],
    ) -> anyhow::Result<Value> {
        let mut input = phase_input.as_object().cloned().unwrap_or_default();
        input.insert("gate_hints".to_string(), serde_json::to_value(hints)?);
        Ok(Value::Object(input))
    }
}
