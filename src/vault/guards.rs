//! Vault guards: grounding verification and contradiction detection.

use std::collections::HashSet;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;

use super::store::FrameStore;

/// Outcome of the grounding guard for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingReport {
    pub grounded: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub valid_citations: usize,
    pub total_citations: usize,
}

/// Verify one citation by prefix dispatch.
///
/// `frame_*` must resolve in the frame store, `artifact:`/`uri:` in the
/// artifact table, `q_*`/`a_*` in the QA bindings; `http(s)://` is taken
/// on faith; anything else is unknown and fails.
pub fn verify_citation(store: &FrameStore, citation: &str) -> Result<bool> {
    if citation.starts_with("http://") || citation.starts_with("https://") {
        return Ok(true);
    }
    if citation.starts_with("frame_") {
        return Ok(store.get_frame(citation)?.is_some());
    }
    if let Some(rest) = citation.strip_prefix("artifact:") {
        return store.artifact_exists(rest);
    }
    if let Some(rest) = citation.strip_prefix("uri:") {
        return store.artifact_exists(rest);
    }
    if citation.starts_with("q_") || citation.starts_with("a_") {
        return store.qa_citation_exists(citation);
    }
    Ok(false)
}

/// Grounding guard: a frame is grounded iff it has at least one citation,
/// its claim/citation ratio is under the cap, and at least half of the
/// citations verify. The score blends ratio quality with citation
/// validity; the acceptance threshold comes from [`VaultConfig`].
pub fn check_grounding(
    store: &FrameStore,
    claims: &[String],
    citations: &[String],
    config: &VaultConfig,
) -> Result<GroundingReport> {
    if citations.is_empty() {
        return Ok(GroundingReport {
            grounded: false,
            score: 0.0,
            reason: Some("No citations".to_string()),
            valid_citations: 0,
            total_citations: 0,
        });
    }

    let ratio = claims.len() as f64 / citations.len() as f64;
    if ratio >= config.max_claims_per_citation {
        return Ok(GroundingReport {
            grounded: false,
            score: 0.3,
            reason: Some(format!(
                "Too many claims ({}) for citations ({})",
                claims.len(),
                citations.len()
            )),
            valid_citations: 0,
            total_citations: citations.len(),
        });
    }

    let mut valid = 0usize;
    for citation in citations {
        if verify_citation(store, citation)? {
            valid += 1;
        }
    }
    let valid_ratio = valid as f64 / citations.len() as f64;

    // Ratio quality: full marks up to 1.5 claims per citation, tapering
    // toward the cap.
    let ratio_score = if ratio <= 1.5 { 1.0 } else { 1.5 / ratio };
    let score = 0.5 * ratio_score + 0.5 * valid_ratio;

    if valid_ratio < 0.5 {
        return Ok(GroundingReport {
            grounded: false,
            score,
            reason: Some(format!(
                "Only {valid} of {} citations verify",
                citations.len()
            )),
            valid_citations: valid,
            total_citations: citations.len(),
        });
    }

    let grounded = score >= config.grounding_threshold;
    Ok(GroundingReport {
        grounded,
        score,
        reason: (!grounded).then(|| format!("Grounding score {score:.2} below threshold")),
        valid_citations: valid,
        total_citations: citations.len(),
    })
}

/// Which rule detected a contradicting claim pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContradictionRule {
    OppositeNegation,
    OppositeValue,
    MutuallyExclusive,
}

/// Severity derived from how many claim pairs contradict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn from_pair_count(count: usize) -> Self {
        match count {
            0 => Self::Low,
            1 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// One contradicting claim pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictingPair {
    pub claim_a: String,
    pub claim_b: String,
    pub rule: ContradictionRule,
}

/// A contradiction found between a candidate and an existing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub frame_id: String,
    pub theme: String,
    pub pairs: Vec<ContradictingPair>,
    pub severity: Severity,
}

const NEGATION_TOKENS: &[&str] = &[
    "not", "no", "never", "cannot", "can't", "isn't", "aren't", "won't", "don't", "doesn't",
];

const OPPOSITE_PAIRS: &[(&str, &str)] = &[
    ("true", "false"),
    ("yes", "no"),
    ("allowed", "forbidden"),
    ("enabled", "disabled"),
    ("on", "off"),
    ("open", "closed"),
    ("valid", "invalid"),
    ("correct", "incorrect"),
];

const JACCARD_THRESHOLD: f64 = 0.8;

fn tokenize(claim: &str) -> Vec<String> {
    claim
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn without<'a>(tokens: &'a [String], drop: &HashSet<&str>) -> HashSet<String> {
    tokens
        .iter()
        .filter(|t| !drop.contains(t.as_str()))
        .cloned()
        .collect()
}

/// Detect whether two claims contradict, and by which rule.
pub fn claims_contradict(a: &str, b: &str) -> Option<ContradictionRule> {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);

    // Opposite-negation: exactly one side is negated and the rest of the
    // claims are nearly identical.
    let negations: HashSet<&str> = NEGATION_TOKENS.iter().copied().collect();
    let negated_a = tokens_a.iter().any(|t| negations.contains(t.as_str()));
    let negated_b = tokens_b.iter().any(|t| negations.contains(t.as_str()));
    if negated_a != negated_b {
        let rest_a = without(&tokens_a, &negations);
        let rest_b = without(&tokens_b, &negations);
        if jaccard(&rest_a, &rest_b) > JACCARD_THRESHOLD {
            return Some(ContradictionRule::OppositeNegation);
        }
    }

    // Opposite-value: one claim carries one side of a known opposite pair,
    // the other the other side, and the remainders are nearly identical.
    for (left, right) in OPPOSITE_PAIRS {
        let has = |tokens: &[String], word: &str| tokens.iter().any(|t| t == word);
        let forward = has(&tokens_a, left) && has(&tokens_b, right);
        let backward = has(&tokens_a, right) && has(&tokens_b, left);
        if forward || backward {
            let drop: HashSet<&str> = [*left, *right].into_iter().collect();
            let rest_a = without(&tokens_a, &drop);
            let rest_b = without(&tokens_b, &drop);
            if jaccard(&rest_a, &rest_b) > JACCARD_THRESHOLD {
                return Some(ContradictionRule::OppositeValue);
            }
        }
    }

    // Mutually-exclusive: "<subject> must be <value>" with the same
    // subject and different values.
    let must_be = Regex::new(r"(?i)^(.*?)\s+must\s+be\s+(.*)$").expect("static regex");
    if let (Some(cap_a), Some(cap_b)) = (must_be.captures(a.trim()), must_be.captures(b.trim())) {
        let subject_a = cap_a[1].trim().to_lowercase();
        let subject_b = cap_b[1].trim().to_lowercase();
        let value_a = cap_a[2].trim().trim_end_matches('.').to_lowercase();
        let value_b = cap_b[2].trim().trim_end_matches('.').to_lowercase();
        if subject_a == subject_b && value_a != value_b {
            return Some(ContradictionRule::MutuallyExclusive);
        }
    }

    None
}

/// Check a candidate's claims against every stored frame of the same
/// theme. Returns one [`Contradiction`] per conflicting frame.
pub fn find_contradictions(
    store: &FrameStore,
    theme: &str,
    claims: &[String],
) -> Result<Vec<Contradiction>> {
    let mut found = Vec::new();
    for frame in store.frames_by_theme(theme)? {
        let mut pairs = Vec::new();
        for claim_a in claims {
            for claim_b in &frame.claims {
                if let Some(rule) = claims_contradict(claim_a, claim_b) {
                    pairs.push(ContradictingPair {
                        claim_a: claim_a.clone(),
                        claim_b: claim_b.clone(),
                        rule,
                    });
                }
            }
        }
        if !pairs.is_empty() {
            found.push(Contradiction {
                frame_id: frame.id.clone(),
                theme: theme.to_string(),
                severity: Severity::from_pair_count(pairs.len()),
                pairs,
            });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::frame::{KnowledgeFrame, Provenance, Scope};
    use chrono::Utc;

    fn store_with_frame(claims: &[&str]) -> FrameStore {
        let store = FrameStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_frame(&KnowledgeFrame {
                id: "frame_existing".into(),
                scope: Scope::Run,
                theme: "pricing".into(),
                summary: "Existing pricing knowledge".into(),
                claims: claims.iter().map(|c| c.to_string()).collect(),
                citations: vec!["https://example.com".into()],
                parents: vec![],
                children: vec![],
                version: "1.0.0".into(),
                provenance: Provenance {
                    who: "seed".into(),
                    when: now,
                    tools: vec![],
                    inputs: vec![],
                    signature: None,
                },
                created_at: now,
                updated_at: now,
                ttl_ms: None,
                pinned: false,
                tags: vec![],
            })
            .unwrap();
        store
    }

    #[test]
    fn test_citation_prefix_dispatch() {
        let store = store_with_frame(&["The base tier is free"]);
        assert!(verify_citation(&store, "https://example.com/doc").unwrap());
        assert!(verify_citation(&store, "http://example.com/doc").unwrap());
        assert!(verify_citation(&store, "frame_existing").unwrap());
        assert!(!verify_citation(&store, "frame_missing").unwrap());
        assert!(!verify_citation(&store, "artifact:missing").unwrap());
        assert!(!verify_citation(&store, "q_missing").unwrap());
        assert!(!verify_citation(&store, "some-freeform-note").unwrap());
    }

    #[test]
    fn test_grounding_rejects_no_citations() {
        let store = FrameStore::open_in_memory().unwrap();
        let report =
            check_grounding(&store, &["claim one".into()], &[], &VaultConfig::default()).unwrap();
        assert!(!report.grounded);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.reason.as_deref(), Some("No citations"));
    }

    #[test]
    fn test_grounding_rejects_claim_heavy_frames() {
        let store = FrameStore::open_in_memory().unwrap();
        let claims: Vec<String> = (0..5).map(|n| format!("claim number {n}")).collect();
        let report = check_grounding(
            &store,
            &claims,
            &["https://example.com".into()],
            &VaultConfig::default(),
        )
        .unwrap();
        assert!(!report.grounded);
        assert!((report.score - 0.3).abs() < 1e-9);
        assert_eq!(
            report.reason.as_deref(),
            Some("Too many claims (5) for citations (1)")
        );
    }

    #[test]
    fn test_grounding_accepts_well_cited_frames() {
        let store = FrameStore::open_in_memory().unwrap();
        let report = check_grounding(
            &store,
            &["claim one is here".into()],
            &["https://example.com/a".into()],
            &VaultConfig::default(),
        )
        .unwrap();
        assert!(report.grounded);
        assert!(report.score >= 0.7);
        assert_eq!(report.valid_citations, 1);
    }

    #[test]
    fn test_grounding_requires_half_valid_citations() {
        let store = FrameStore::open_in_memory().unwrap();
        let report = check_grounding(
            &store,
            &["claim one is here".into()],
            &[
                "unknown-citation-1".into(),
                "unknown-citation-2".into(),
                "https://example.com".into(),
            ],
            &VaultConfig::default(),
        )
        .unwrap();
        assert!(!report.grounded);
        assert!(report.reason.unwrap().contains("1 of 3"));
    }

    #[test]
    fn test_opposite_negation_detection() {
        assert_eq!(
            claims_contradict(
                "the base tier is free for everyone",
                "the base tier is not free for everyone"
            ),
            Some(ContradictionRule::OppositeNegation)
        );
        // Different enough content: no contradiction.
        assert_eq!(
            claims_contradict("the base tier is free", "shipping is not included anywhere"),
            None
        );
    }

    #[test]
    fn test_opposite_value_detection() {
        assert_eq!(
            claims_contradict(
                "beta access is enabled for tenants",
                "beta access is disabled for tenants"
            ),
            Some(ContradictionRule::OppositeValue)
        );
    }

    #[test]
    fn test_mutually_exclusive_detection() {
        assert_eq!(
            claims_contradict(
                "The default region must be us-east-1",
                "The default region must be eu-west-2"
            ),
            Some(ContradictionRule::MutuallyExclusive)
        );
        assert_eq!(
            claims_contradict(
                "The default region must be us-east-1",
                "The default region must be us-east-1"
            ),
            None
        );
    }

    #[test]
    fn test_find_contradictions_scans_theme() {
        let store = store_with_frame(&["refunds are allowed for all tiers"]);
        let found = find_contradictions(
            &store,
            "pricing",
            &["refunds are forbidden for all tiers".to_string()],
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].frame_id, "frame_existing");
        assert_eq!(found[0].severity, Severity::Medium);
        assert_eq!(found[0].pairs[0].rule, ContradictionRule::OppositeValue);

        // A different theme is not consulted.
        let other = find_contradictions(
            &store,
            "billing",
            &["refunds are forbidden for all tiers".to_string()],
        )
        .unwrap();
        assert!(other.is_empty());
    }
}
