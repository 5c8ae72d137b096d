//! Gate evaluation types and the gatekeeper seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{GateEvidence, GateResult};

/// What the gatekeeper receives for one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluationInput {
    pub artifacts: Vec<String>,
    pub rubrics: Value,
    pub metrics: Value,
}

/// One rubric metric that fell short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMetric {
    pub metric: String,
    pub actual: f64,
    pub threshold: f64,
}

/// The gatekeeper's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub result: GateResult,
    /// 0-100.
    pub score: f64,
    pub evidence: Vec<GateEvidence>,
    #[serde(default)]
    pub failed_metrics: Vec<FailedMetric>,
    #[serde(default)]
    pub human_review_required: bool,
    #[serde(default)]
    pub can_waive: bool,
    pub evidence_pack_id: String,
}

/// Structured per-metric feedback fed into the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateHint {
    pub metric: String,
    pub actual: f64,
    pub threshold: f64,
    pub advice: String,
}

/// Derive one hint per failed metric.
pub fn hints_from(evaluation: &GateEvaluation) -> Vec<GateHint> {
    evaluation
        .failed_metrics
        .iter()
        .map(|failed| GateHint {
            metric: failed.metric.clone(),
            actual: failed.actual,
            threshold: failed.threshold,
            advice: format!(
                "Raise {} from {:.2} to at least {:.2}",
                failed.metric, failed.actual, failed.threshold
            ),
        })
        .collect()
}

/// External quality gate.
#[async_trait]
pub trait Gatekeeper: Send + Sync {
    async fn evaluate(&self, input: &GateEvaluationInput) -> anyhow::Result<GateEvaluation>;
}
