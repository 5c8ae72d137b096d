//! Event envelope and payload families.
//!
//! Every event carries the same envelope; the payload is one variant of
//! [`EventPayload`], whose serialized tag doubles as the bus topic.
//! Schemas are strict: unrecognized fields are rejected on ingress.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::PhaseName;
use crate::task::TaskMetrics;

/// Gate verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateResult {
    Pass,
    Fail,
    Warn,
}

/// Per-criterion gate evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateEvidence {
    pub criterion: String,
    pub passed: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Where a tool execution ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRuntime {
    Docker,
    Wasm,
    Native,
}

/// Event payload families. The variant name, serialized, is the topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum EventPayload {
    // ── Workflow ─────────────────────────────────────────────────────
    #[serde(rename = "workflow.created")]
    WorkflowCreated {},
    #[serde(rename = "workflow.state.changed")]
    WorkflowStateChanged { from: String, to: String, reason: String },
    #[serde(rename = "workflow.paused")]
    WorkflowPaused {},
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed {},
    #[serde(rename = "workflow.failed")]
    WorkflowFailed { error: String },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted {
        total_cost_usd: f64,
        total_tokens: u64,
        duration_ms: u64,
        artifact_count: usize,
    },

    // ── Phase ────────────────────────────────────────────────────────
    #[serde(rename = "phase.started")]
    PhaseStarted {
        phase_run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_hash: Option<String>,
    },
    #[serde(rename = "phase.progress")]
    PhaseProgress {
        task_id: i64,
        pct: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<TaskMetrics>,
    },
    #[serde(rename = "phase.stalled")]
    PhaseStalled {
        task_id: i64,
        last_heartbeat: DateTime<Utc>,
        duration_ms: u64,
    },
    #[serde(rename = "phase.ready")]
    PhaseReady {
        artifacts: Vec<String>,
        completed_at: DateTime<Utc>,
    },
    #[serde(rename = "phase.gate.passed")]
    PhaseGatePassed {
        evidence_pack_id: String,
        score: f64,
        rubrics_met: Vec<String>,
    },
    #[serde(rename = "phase.gate.failed")]
    PhaseGateFailed {
        reasons: Vec<String>,
        score: f64,
        required_actions: Vec<String>,
        can_waive: bool,
    },
    #[serde(rename = "phase.error")]
    PhaseError {
        error: String,
        retryable: bool,
        retry_count: u32,
    },

    // ── Agent ────────────────────────────────────────────────────────
    #[serde(rename = "agent.started")]
    AgentStarted { agent: String },
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        agent: String,
        cost: f64,
        tokens: u64,
        duration: u64,
        #[serde(default)]
        tools: Vec<String>,
    },
    #[serde(rename = "agent.failed")]
    AgentFailed {
        agent: String,
        retry_count: u32,
        retryable: bool,
    },
    #[serde(rename = "agent.tool.requested")]
    AgentToolRequested {
        tool: String,
        voi_score: f64,
        estimated_cost: f64,
    },

    // ── Tool ─────────────────────────────────────────────────────────
    #[serde(rename = "tool.execution.started")]
    ToolExecutionStarted {
        tool: String,
        runtime: ToolRuntime,
        input: Value,
    },
    #[serde(rename = "tool.execution.completed")]
    ToolExecutionCompleted {
        tool: String,
        runtime: ToolRuntime,
        output: Value,
        duration_ms: u64,
    },
    #[serde(rename = "tool.execution.failed")]
    ToolExecutionFailed {
        tool: String,
        runtime: ToolRuntime,
        error: String,
    },

    // ── Gate ─────────────────────────────────────────────────────────
    #[serde(rename = "gate.evaluation.started")]
    GateEvaluationStarted {},
    #[serde(rename = "gate.evaluation.completed")]
    GateEvaluationCompleted {
        result: GateResult,
        score: f64,
        evidence: Vec<GateEvidence>,
        human_review_required: bool,
    },
    #[serde(rename = "gate.blocked")]
    GateBlocked { reason: String },

    // ── Budget ───────────────────────────────────────────────────────
    #[serde(rename = "budget.threshold.exceeded")]
    BudgetThresholdExceeded {
        resource: String,
        used_pct: f64,
    },
    #[serde(rename = "budget.limit.reached")]
    BudgetLimitReached { resource: String },

    // ── Artifact ─────────────────────────────────────────────────────
    #[serde(rename = "artifact.created")]
    ArtifactCreated {
        artifact_id: String,
        uri: String,
        sha256: String,
    },

    // ── Memory delta ─────────────────────────────────────────────────
    #[serde(rename = "memory.delta.created")]
    MemoryDeltaCreated { frame_id: String, theme: String },
    #[serde(rename = "memory.delta.updated")]
    MemoryDeltaUpdated { frame_id: String, theme: String },
    #[serde(rename = "memory.delta.deleted")]
    MemoryDeltaDeleted { frame_id: String, theme: String },
}

impl EventPayload {
    /// The dot-separated topic this payload publishes under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::WorkflowCreated {} => "workflow.created",
            Self::WorkflowStateChanged { .. } => "workflow.state.changed",
            Self::WorkflowPaused {} => "workflow.paused",
            Self::WorkflowResumed {} => "workflow.resumed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::PhaseStarted { .. } => "phase.started",
            Self::PhaseProgress { .. } => "phase.progress",
            Self::PhaseStalled { .. } => "phase.stalled",
            Self::PhaseReady { .. } => "phase.ready",
            Self::PhaseGatePassed { .. } => "phase.gate.passed",
            Self::PhaseGateFailed { .. } => "phase.gate.failed",
            Self::PhaseError { .. } => "phase.error",
            Self::AgentStarted { .. } => "agent.started",
            Self::AgentCompleted { .. } => "agent.completed",
            Self::AgentFailed { .. } => "agent.failed",
            Self::AgentToolRequested { .. } => "agent.tool.requested",
            Self::ToolExecutionStarted { .. } => "tool.execution.started",
            Self::ToolExecutionCompleted { .. } => "tool.execution.completed",
            Self::ToolExecutionFailed { .. } => "tool.execution.failed",
            Self::GateEvaluationStarted {} => "gate.evaluation.started",
            Self::GateEvaluationCompleted { .. } => "gate.evaluation.completed",
            Self::GateBlocked { .. } => "gate.blocked",
            Self::BudgetThresholdExceeded { .. } => "budget.threshold.exceeded",
            Self::BudgetLimitReached { .. } => "budget.limit.reached",
            Self::ArtifactCreated { .. } => "artifact.created",
            Self::MemoryDeltaCreated { .. } => "memory.delta.created",
            Self::MemoryDeltaUpdated { .. } => "memory.delta.updated",
            Self::MemoryDeltaDeleted { .. } => "memory.delta.deleted",
        }
    }
}

/// The event envelope shared by every family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub payload: EventPayload,
}

impl Event {
    /// Build a new event with a fresh id and the current timestamp.
    pub fn new(run_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: run_id.into(),
            phase: None,
            correlation_id: None,
            metadata: None,
            payload,
        }
    }

    pub fn with_phase(mut self, phase: PhaseName) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// The bus topic for this event.
    pub fn topic(&self) -> &'static str {
        self.payload.topic()
    }

    /// Semantic checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            bail!("event {} has empty run_id", self.event_id);
        }
        match &self.payload {
            EventPayload::GateEvaluationCompleted { score, evidence, .. } => {
                if !(0.0..=100.0).contains(score) {
                    bail!("gate score {score} outside 0-100");
                }
                for item in evidence {
                    if !(0.0..=100.0).contains(&item.score) {
                        bail!("evidence score {} outside 0-100", item.score);
                    }
                }
            }
            EventPayload::PhaseProgress { pct, .. } => {
                if *pct > 100 {
                    bail!("progress pct {pct} outside 0-100");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parse and validate an event arriving from outside the process.
pub fn ingest_event(raw: &Value) -> Result<Event> {
    let event: Event = serde_json::from_value(raw.clone())?;
    event.validate()?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_matches_serialized_tag() {
        let event = Event::new(
            "run-1",
            EventPayload::PhaseGatePassed {
                evidence_pack_id: "ep-1".into(),
                score: 92.0,
                rubrics_met: vec!["clarity".into()],
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["payload"].get("phase.gate.passed").is_some());
        assert_eq!(event.topic(), "phase.gate.passed");
    }

    #[test]
    fn test_round_trip() {
        let event = Event::new(
            "run-1",
            EventPayload::AgentCompleted {
                agent: "prd-writer".into(),
                cost: 0.02,
                tokens: 1_800,
                duration: 4_200,
                tools: vec!["search".into()],
            },
        )
        .with_phase(PhaseName::Prd);
        let value = serde_json::to_value(&event).unwrap();
        let back = ingest_event(&value).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.phase, Some(PhaseName::Prd));
        assert_eq!(back.topic(), "agent.completed");
    }

    #[test]
    fn test_unrecognized_envelope_field_rejected() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "run_id": "run-1",
            "payload": {"workflow.created": {}},
            "extra": true
        });
        assert!(ingest_event(&raw).is_err());
    }

    #[test]
    fn test_unrecognized_payload_field_rejected() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "run_id": "run-1",
            "payload": {"workflow.failed": {"error": "x", "bogus": 1}}
        });
        assert!(ingest_event(&raw).is_err());
    }

    #[test]
    fn test_gate_score_bounds_checked() {
        let event = Event::new(
            "run-1",
            EventPayload::GateEvaluationCompleted {
                result: GateResult::Pass,
                score: 120.0,
                evidence: vec![],
                human_review_required: false,
            },
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_empty_run_id_rejected() {
        let event = Event::new("", EventPayload::WorkflowCreated {});
        assert!(event.validate().is_err());
    }
}
