//! Memory gate: coverage-and-freshness precondition over required themes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;

use super::frame::Scope;
use super::store::FrameStore;

/// What the gate requires before a phase may proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGateSpec {
    pub required_themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_freshness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_frames_per_theme: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

/// Per-theme gate evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeCoverage {
    pub theme: String,
    pub frames: usize,
    pub mean_freshness: f64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGateOutcome {
    pub passed: bool,
    pub coverage: Vec<ThemeCoverage>,
}

/// Evaluate the gate: every required theme needs at least the required
/// frame count with mean freshness at or above the threshold.
pub fn evaluate_gate(
    store: &FrameStore,
    spec: &MemoryGateSpec,
    config: &VaultConfig,
    now: DateTime<Utc>,
) -> Result<MemoryGateOutcome> {
    let min_frames = spec.min_frames_per_theme.unwrap_or(1);
    let min_freshness = spec.min_freshness.unwrap_or(0.0);

    let mut coverage = Vec::with_capacity(spec.required_themes.len());
    let mut passed = true;
    for theme in &spec.required_themes {
        let frames = store.frames_with_theme_prefix(theme, spec.scope, usize::MAX >> 1)?;
        let mean_freshness = if frames.is_empty() {
            0.0
        } else {
            frames.iter().map(|f| f.freshness(now, config)).sum::<f64>() / frames.len() as f64
        };
        let ok = frames.len() >= min_frames && mean_freshness >= min_freshness;
        passed &= ok;
        coverage.push(ThemeCoverage {
            theme: theme.clone(),
            frames: frames.len(),
            mean_freshness,
            ok,
        });
    }
    Ok(MemoryGateOutcome { passed, coverage })
}
