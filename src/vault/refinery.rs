//! Refinery front half: fission of raw text into atomic claims.
//!
//! Fusion (dedup by key) and validation run against the store and live in
//! the vault facade; the splitting rules here are pure.

use serde::{Deserialize, Serialize};

use super::frame::Scope;
use super::guards::Contradiction;

/// Connector words that split a sentence into separate claims.
const CONNECTORS: &[&str] = &["and", "also", "furthermore", "additionally", "moreover"];

/// Claims shorter than this are dropped as noise.
const MIN_CLAIM_LEN: usize = 10;

/// Unrefined knowledge handed to the refinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawKnowledge {
    pub scope: Scope,
    pub theme: String,
    pub text: String,
    pub citations: Vec<String>,
    /// Producer recorded in provenance.
    pub who: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One input the refinery could not accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedKnowledge {
    pub theme: String,
    pub reason: String,
}

/// What a refinery pass produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefineReport {
    /// Frame ids newly created.
    pub accepted: Vec<String>,
    /// Frame ids merged into by fusion.
    pub merged: Vec<String>,
    pub rejected: Vec<RejectedKnowledge>,
    pub conflicts: Vec<Contradiction>,
}

/// Split raw text into atomic claims: sentence boundaries first, then
/// connector words, dropping fragments under the length floor.
pub fn fission(text: &str) -> Vec<String> {
    let mut claims = Vec::new();
    for sentence in text.split(['.', '!', '?', '\n']) {
        let mut current = Vec::new();
        for word in sentence.split_whitespace() {
            let bare = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if CONNECTORS.contains(&bare.as_str()) {
                push_claim(&mut claims, &current);
                current.clear();
            } else {
                current.push(word);
            }
        }
        push_claim(&mut claims, &current);
    }
    claims
}

fn push_claim(claims: &mut Vec<String>, words: &[&str]) {
    let claim = words.join(" ");
    let claim = claim.trim();
    if claim.len() >= MIN_CLAIM_LEN {
        claims.push(claim.to_string());
    }
}

/// A one-line summary for a refined frame: the first claim, truncated.
pub fn summarize(claims: &[String], limit: usize) -> String {
    let first = claims.first().map(String::as_str).unwrap_or_default();
    if first.len() <= limit {
        first.to_string()
    } else {
        let mut cut = limit;
        while !first.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &first[..cut])
    }
}
