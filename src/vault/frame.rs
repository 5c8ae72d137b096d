//! Knowledge frame model: atomic, cited, versioned units of durable
//! knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::VaultConfig;
use crate::keys::canonical_json;

/// Visibility and lifetime scope of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Ephemeral,
    Run,
    Tenant,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Run => "run",
            Self::Tenant => "tenant",
            Self::Global => "global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ephemeral" => Some(Self::Ephemeral),
            "run" => Some(Self::Run),
            "tenant" => Some(Self::Tenant),
            "global" => Some(Self::Global),
            _ => None,
        }
    }

    /// Base retrieval weight; the query scope, when named, outranks all.
    pub fn pack_weight(&self) -> f64 {
        match self {
            Self::Tenant => 8.0,
            Self::Run => 6.0,
            Self::Global => 4.0,
            Self::Ephemeral => 2.0,
        }
    }
}

/// Who produced a frame, with what, from what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub who: String,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Content signature over the frame's identifying fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// An atomic, cited, versioned unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFrame {
    pub id: String,
    pub scope: Scope,
    pub theme: String,
    pub summary: String,
    pub claims: Vec<String>,
    pub citations: Vec<String>,
    /// Parent/child frame ids; stored as references, never as a graph.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
    /// Semver-ish; fusion bumps the patch component.
    pub version: String,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl KnowledgeFrame {
    /// Effective TTL: the frame's own, or the scope default.
    pub fn effective_ttl_ms(&self, config: &VaultConfig) -> u64 {
        self.ttl_ms.unwrap_or(match self.scope {
            Scope::Ephemeral => config.ttl_ephemeral_ms,
            Scope::Run => config.ttl_run_ms,
            Scope::Tenant => config.ttl_tenant_ms,
            Scope::Global => config.ttl_global_ms,
        })
    }

    /// Freshness in [0, 1]: `1 - age/ttl`, clamped. Pinned frames are
    /// always fully fresh (TTL ignored).
    pub fn freshness(&self, now: DateTime<Utc>, config: &VaultConfig) -> f64 {
        if self.pinned {
            return 1.0;
        }
        let ttl_ms = self.effective_ttl_ms(config);
        if ttl_ms == 0 {
            return 0.0;
        }
        let age_ms = (now - self.created_at).num_milliseconds().max(0) as f64;
        (1.0 - age_ms / ttl_ms as f64).clamp(0.0, 1.0)
    }

    /// Content signature: SHA-256 over the canonical identifying fields.
    pub fn compute_signature(&self) -> String {
        let envelope = serde_json::json!({
            "id": self.id,
            "scope": self.scope.as_str(),
            "theme": self.theme,
            "summary": self.summary,
            "claims": self.claims,
            "citations": self.citations,
            "version": self.version,
        });
        hex::encode(Sha256::digest(canonical_json(&envelope).as_bytes()))
    }

    /// Fusion dedup key: SHA-256 over scope, theme, and the sorted
    /// lowercased claims.
    pub fn fusion_key(scope: Scope, theme: &str, claims: &[String]) -> String {
        let mut normalized: Vec<String> =
            claims.iter().map(|c| c.trim().to_lowercase()).collect();
        normalized.sort();
        let mut hasher = Sha256::default();
        hasher.update(scope.as_str().as_bytes());
        hasher.update(theme.as_bytes());
        for claim in &normalized {
            hasher.update(claim.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Bump the patch component of a semver-ish version string.
    pub fn bump_patch(version: &str) -> String {
        let mut parts: Vec<u64> = version.split('.').filter_map(|p| p.parse().ok()).collect();
        while parts.len() < 3 {
            parts.push(0);
        }
        parts[2] += 1;
        format!("{}.{}.{}", parts[0], parts[1], parts[2])
    }
}
