//! Context pack builder: ranked, freshness-aware, token-budgeted frame
//! retrieval.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;

use super::frame::{KnowledgeFrame, Scope};
use super::store::FrameStore;

/// A vault retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Theme prefixes to retrieve; an exact match scores higher.
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Preferred producer (`provenance.who`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_freshness: Option<f64>,
    /// Max frames in the pack.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Overrides the configured token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
}

fn default_limit() -> usize {
    20
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            themes: Vec::new(),
            scope: None,
            phase: None,
            doer: None,
            min_freshness: None,
            limit: default_limit(),
            token_budget: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackMetadata {
    pub candidates: usize,
    pub packed: usize,
    pub token_estimate: u64,
    pub token_budget: u64,
}

/// The ranked, budget-bounded result of a vault query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub frames: Vec<KnowledgeFrame>,
    /// Artifact references cited by the packed frames.
    pub artifacts: Vec<String>,
    /// Union of packed citations, first-seen order.
    pub citations: Vec<String>,
    /// Mean freshness of the packed frames.
    pub freshness_score: f64,
    pub policy_hints: Vec<String>,
    pub metadata: PackMetadata,
}

/// Token cost estimate for a frame: a chars/4 heuristic over summary and
/// claims plus a flat charge per citation.
pub fn estimate_tokens(frame: &KnowledgeFrame) -> u64 {
    let chars: usize =
        frame.summary.len() + frame.claims.iter().map(String::len).sum::<usize>();
    (chars as u64).div_ceil(4) + 5 * frame.citations.len() as u64
}

/// Relevance score for one frame against a query.
pub fn score_frame(
    frame: &KnowledgeFrame,
    query: &MemoryQuery,
    freshness: f64,
) -> f64 {
    let mut score = 0.0;

    let theme_score = query
        .themes
        .iter()
        .filter_map(|theme| {
            if frame.theme == *theme {
                Some(15.0)
            } else if frame.theme.starts_with(theme.as_str()) {
                Some(10.0)
            } else {
                None
            }
        })
        .fold(0.0f64, f64::max);
    score += theme_score;

    score += 5.0 * freshness;

    score += match query.scope {
        Some(scope) if scope == frame.scope => 10.0,
        _ => frame.scope.pack_weight(),
    };

    if let Some(doer) = &query.doer {
        if frame.provenance.who == *doer {
            score += 3.0;
        }
    }

    if let Some(phase) = &query.phase {
        let needle = phase.to_lowercase();
        if frame.theme.to_lowercase().contains(&needle)
            || frame.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
        {
            score += 2.0;
        }
    }

    if frame.pinned {
        score += 5.0;
    }

    score += (0.5 * frame.citations.len() as f64).min(5.0);
    score
}

/// Retrieve candidates, score them, and pack greedily under the token
/// budget. Deterministic for identical inputs and store state.
pub fn build_pack(
    store: &FrameStore,
    query: &MemoryQuery,
    config: &VaultConfig,
    now: DateTime<Utc>,
) -> Result<ContextPack> {
    let candidate_cap = config.candidate_multiplier * query.limit.max(1);
    let mut candidates: Vec<KnowledgeFrame> = Vec::new();
    for theme in &query.themes {
        for frame in store.frames_with_theme_prefix(theme, query.scope, candidate_cap)? {
            if !candidates.iter().any(|seen| seen.id == frame.id) {
                candidates.push(frame);
            }
        }
    }
    candidates.truncate(candidate_cap);
    let candidate_count = candidates.len();

    let min_freshness = query.min_freshness.unwrap_or(0.0);
    let mut scored: Vec<(f64, f64, KnowledgeFrame)> = candidates
        .into_iter()
        .filter_map(|frame| {
            let freshness = frame.freshness(now, config);
            if freshness < min_freshness {
                return None;
            }
            let score = score_frame(&frame, query, freshness);
            Some((score, freshness, frame))
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.2.id.cmp(&b.2.id))
    });

    let budget = query.token_budget.unwrap_or(config.pack_token_budget);
    let mut frames = Vec::new();
    let mut freshness_sum = 0.0;
    let mut token_estimate = 0u64;
    for (_, freshness, frame) in scored {
        if frames.len() >= query.limit {
            break;
        }
        let cost = estimate_tokens(&frame);
        if token_estimate + cost > budget {
            continue;
        }
        token_estimate += cost;
        freshness_sum += freshness;
        frames.push(frame);
    }

    let mut citations = Vec::new();
    let mut artifacts = Vec::new();
    for frame in &frames {
        for citation in &frame.citations {
            if !citations.contains(citation) {
                citations.push(citation.clone());
            }
            if citation.starts_with("artifact:") || citation.starts_with("uri:") {
                let reference = citation
                    .trim_start_matches("artifact:")
                    .trim_start_matches("uri:")
                    .to_string();
                if !artifacts.contains(&reference) {
                    artifacts.push(reference);
                }
            }
        }
    }

    let mut policy_hints = Vec::new();
    for theme in &query.themes {
        if !frames.iter().any(|frame| frame.theme.starts_with(theme.as_str())) {
            policy_hints.push(format!("missing-theme:{theme}"));
        }
    }
    for frame in &frames {
        if frame.freshness(now, config) < 0.3 {
            let hint = format!("stale-theme:{}", frame.theme);
            if !policy_hints.contains(&hint) {
                policy_hints.push(hint);
            }
        }
    }

    let freshness_score = if frames.is_empty() {
        0.0
    } else {
        freshness_sum / frames.len() as f64
    };

    Ok(ContextPack {
        metadata: PackMetadata {
            candidates: candidate_count,
            packed: frames.len(),
            token_estimate,
            token_budget: budget,
        },
        frames,
        artifacts,
        citations,
        freshness_score,
        policy_hints,
    })
}
