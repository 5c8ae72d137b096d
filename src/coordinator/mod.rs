//! Phase coordinator: the template engine that drives one phase run.
//!
//! The coordinator initializes the driver's agents, runs them under the
//! plan's parallelism model, aggregates results once enough agents
//! succeed, and (when a gatekeeper is wired in) evaluates the quality
//! gate, feeding structured hints back into bounded retries.

pub mod driver;
pub mod gate;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::events::{Event, EventBus, EventPayload, GateResult};
use crate::plan::{Parallelism, PhasePlan};
use crate::registry::{ExecutionContext, ExecutorRegistry};
use crate::task::Budget;

pub use driver::{AgentRun, PhaseDriver};
pub use gate::{
    hints_from, FailedMetric, GateEvaluation, GateEvaluationInput, GateHint, Gatekeeper,
};

/// Per-phase run policy.
#[derive(Debug, Clone)]
pub struct PhaseRunConfig {
    /// The phase proceeds once this many agents succeed; below it, the
    /// attempt fails.
    pub min_required_agents: usize,
    /// Concurrency cap under the `parallel` model.
    pub max_concurrency: usize,
    /// Re-run the phase with gate hints when the gate fails.
    pub auto_retry_on_gate_fail: bool,
    pub max_gate_retries: u32,
}

impl Default for PhaseRunConfig {
    fn default() -> Self {
        Self {
            min_required_agents: 1,
            max_concurrency: 4,
            auto_retry_on_gate_fail: false,
            max_gate_retries: 2,
        }
    }
}

impl PhaseRunConfig {
    pub fn with_min_required_agents(mut self, min: usize) -> Self {
        self.min_required_agents = min;
        self
    }

    pub fn with_gate_retries(mut self, max_retries: u32) -> Self {
        self.auto_retry_on_gate_fail = true;
        self.max_gate_retries = max_retries;
        self
    }
}

/// What a phase run produced.
#[derive(Debug, Clone)]
pub struct PhaseRunOutcome {
    pub phase_run_id: String,
    pub artifacts: Vec<String>,
    pub successes: usize,
    pub failures: usize,
    /// The final gate evaluation, when a gatekeeper is configured.
    pub gate: Option<GateEvaluation>,
    /// Attempts consumed (1 = no gate retry needed).
    pub attempts: u32,
}

impl PhaseRunOutcome {
    /// Whether the run ended gate-clean (or ungated).
    pub fn gate_passed(&self) -> bool {
        self.gate
            .as_ref()
            .map(|g| g.result != GateResult::Fail)
            .unwrap_or(true)
    }
}

/// Drives phases described by a [`PhaseDriver`].
pub struct PhaseCoordinator {
    registry: Arc<dyn ExecutorRegistry>,
    events: Arc<EventBus>,
    gatekeeper: Option<Arc<dyn Gatekeeper>>,
    config: PhaseRunConfig,
}

impl PhaseCoordinator {
    pub fn new(
        registry: Arc<dyn ExecutorRegistry>,
        events: Arc<EventBus>,
        config: PhaseRunConfig,
    ) -> Self {
        Self { registry, events, gatekeeper: None, config }
    }

    /// Wire in the quality gate (the enhanced variant).
    pub fn with_gatekeeper(mut self, gatekeeper: Arc<dyn Gatekeeper>) -> Self {
        self.gatekeeper = Some(gatekeeper);
        self
    }

    /// Run one phase to completion, including gate retries.
    pub async fn run_phase(
        &self,
        driver: &dyn PhaseDriver,
        plan: &PhasePlan,
        run_id: &str,
        phase_input: &Value,
    ) -> Result<PhaseRunOutcome, EngineError> {
        let phase_run_id = format!(
            "{}-{}",
            plan.phase.as_str().to_lowercase(),
            Uuid::new_v4().simple()
        );
        self.publish(
            run_id,
            plan,
            EventPayload::PhaseStarted { phase_run_id: phase_run_id.clone(), config_hash: None },
        );
        info!(phase = %plan.phase, %phase_run_id, "phase started");

        let mut input = phase_input.clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let runs = self.run_agents(driver, plan, &input).await?;
            let (successes, failures): (Vec<AgentRun>, Vec<AgentRun>) =
                runs.into_iter().partition(AgentRun::succeeded);

            if successes.len() < self.config.min_required_agents {
                let message = format!(
                    "Phase {} attempt {attempt}: {} of {} required agents succeeded",
                    plan.phase,
                    successes.len(),
                    self.config.min_required_agents
                );
                warn!(%phase_run_id, %message, "phase failed");
                self.publish(
                    run_id,
                    plan,
                    EventPayload::PhaseError {
                        error: message.clone(),
                        retryable: false,
                        retry_count: attempt - 1,
                    },
                );
                return Err(EngineError::Other(anyhow::anyhow!(message)));
            }

            let artifacts = driver
                .aggregate_results(&successes, &failures, &input)
                .await
                .map_err(EngineError::Other)?;
            self.publish(
                run_id,
                plan,
                EventPayload::PhaseReady {
                    artifacts: artifacts.clone(),
                    completed_at: chrono::Utc::now(),
                },
            );

            let Some(gatekeeper) = &self.gatekeeper else {
                return Ok(PhaseRunOutcome {
                    phase_run_id,
                    artifacts,
                    successes: successes.len(),
                    failures: failures.len(),
                    gate: None,
                    attempts: attempt,
                });
            };

            self.publish(run_id, plan, EventPayload::GateEvaluationStarted {});
            let gate_input = driver
                .prepare_gate_input(&artifacts, &input)
                .await
                .map_err(EngineError::Other)?;
            let evaluation = gatekeeper
                .evaluate(&gate_input)
                .await
                .map_err(EngineError::Other)?;
            self.publish(
                run_id,
                plan,
                EventPayload::GateEvaluationCompleted {
                    result: evaluation.result,
                    score: evaluation.score,
                    evidence: evaluation.evidence.clone(),
                    human_review_required: evaluation.human_review_required,
                },
            );

            if evaluation.result != GateResult::Fail {
                self.publish(
                    run_id,
                    plan,
                    EventPayload::PhaseGatePassed {
                        evidence_pack_id: evaluation.evidence_pack_id.clone(),
                        score: evaluation.score,
                        rubrics_met: evaluation
                            .evidence
                            .iter()
                            .filter(|e| e.passed)
                            .map(|e| e.criterion.clone())
                            .collect(),
                    },
                );
                info!(%phase_run_id, score = evaluation.score, "gate passed");
                return Ok(PhaseRunOutcome {
                    phase_run_id,
                    artifacts,
                    successes: successes.len(),
                    failures: failures.len(),
                    gate: Some(evaluation),
                    attempts: attempt,
                });
            }

            let hints = hints_from(&evaluation);
            self.publish(
                run_id,
                plan,
                EventPayload::PhaseGateFailed {
                    reasons: evaluation
                        .evidence
                        .iter()
                        .filter(|e| !e.passed)
                        .map(|e| e.criterion.clone())
                        .collect(),
                    score: evaluation.score,
                    required_actions: hints.iter().map(|h| h.advice.clone()).collect(),
                    can_waive: evaluation.can_waive,
                },
            );

            let retries_left =
                self.config.auto_retry_on_gate_fail && attempt <= self.config.max_gate_retries;
            if !retries_left {
                warn!(%phase_run_id, score = evaluation.score, "gate failed; no retries left");
                return Ok(PhaseRunOutcome {
                    phase_run_id,
                    artifacts,
                    successes: successes.len(),
                    failures: failures.len(),
                    gate: Some(evaluation),
                    attempts: attempt,
                });
            }

            debug!(%phase_run_id, attempt, hints = hints.len(), "re-running phase with gate hints");
            input = driver
                .enhance_input_with_hints(&input, &hints)
                .await
                .map_err(EngineError::Other)?;
        }
    }

    /// Run the driver's agents under the plan's parallelism model.
    async fn run_agents(
        &self,
        driver: &dyn PhaseDriver,
        plan: &PhasePlan,
        input: &Value,
    ) -> Result<Vec<AgentRun>, EngineError> {
        let agents = driver.initialize_agents().await.map_err(EngineError::Other)?;
        if agents.is_empty() {
            return Err(EngineError::EmptyPlan);
        }
        let agent_count = agents.len() as u64;
        let budget = Budget {
            ms: plan.timebox_ms()? / agent_count,
            tokens: Some(plan.budgets.tokens / agent_count),
        };

        match plan.parallelism {
            Parallelism::Sequential => {
                let mut runs = Vec::with_capacity(agents.len());
                for agent in &agents {
                    runs.push(self.run_one(driver, plan, agent, input, budget).await);
                }
                Ok(runs)
            }
            Parallelism::Parallel => {
                let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
                let attempts = agents.iter().map(|agent| {
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit =
                            semaphore.acquire().await.expect("semaphore never closed");
                        self.run_one(driver, plan, agent, input, budget).await
                    }
                });
                Ok(futures::future::join_all(attempts).await)
            }
        }
    }

    async fn run_one(
        &self,
        driver: &dyn PhaseDriver,
        plan: &PhasePlan,
        agent: &str,
        phase_input: &Value,
        budget: Budget,
    ) -> AgentRun {
        let prepared = match driver.prepare_agent_input(agent, phase_input).await {
            Ok(prepared) => prepared,
            Err(err) => {
                return AgentRun {
                    agent: agent.to_string(),
                    output: None,
                    error: Some(format!("input preparation failed: {err}")),
                    duration_ms: 0,
                };
            }
        };

        let run_id = phase_input
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.publish(
            &run_id,
            plan,
            EventPayload::AgentStarted { agent: agent.to_string() },
        );

        let ctx = ExecutionContext {
            input: prepared,
            checkpoint: None,
            checkpoint_data: None,
            save_checkpoint: Arc::new(|_, _| {}),
            cancelled: CancellationToken::new(),
            budget,
        };
        let started = std::time::Instant::now();
        let result = self.registry.execute_agent(agent, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.publish(
                    &run_id,
                    plan,
                    EventPayload::AgentCompleted {
                        agent: agent.to_string(),
                        cost: output.cost_usd.unwrap_or(0.0),
                        tokens: output.tokens_used.unwrap_or(0),
                        duration: duration_ms,
                        tools: output.artifacts.clone(),
                    },
                );
                AgentRun {
                    agent: agent.to_string(),
                    output: Some(output),
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                self.publish(
                    &run_id,
                    plan,
                    EventPayload::AgentFailed {
                        agent: agent.to_string(),
                        retry_count: 0,
                        retryable: true,
                    },
                );
                AgentRun {
                    agent: agent.to_string(),
                    output: None,
                    error: Some(err.to_string()),
                    duration_ms,
                }
            }
        }
    }

    fn publish(&self, run_id: &str, plan: &PhasePlan, payload: EventPayload) {
        self.events
            .publish(Event::new(run_id, payload).with_phase(plan.phase));
    }
}
