//! Memory vault: the knowledge frame store with grounding and
//! contradiction guards, the fission/fusion refinery, a freshness-aware
//! context packer, a pub/sub broker, and admin operations.

pub mod broker;
pub mod frame;
pub mod gate;
pub mod guards;
pub mod pack;
pub mod refinery;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::errors::VaultError;
use crate::events::{Event, EventBus, EventPayload};

pub use broker::{MemoryBroker, MemoryEvent};
pub use frame::{KnowledgeFrame, Provenance, Scope};
pub use gate::{MemoryGateOutcome, MemoryGateSpec, ThemeCoverage};
pub use guards::{Contradiction, GroundingReport};
pub use pack::{ContextPack, MemoryQuery};
pub use refinery::{RawKnowledge, RefineReport, RejectedKnowledge};
pub use store::{ArtifactRecord, FrameStore, QaBinding};

/// Run id stamped on vault-originated engine events.
const VAULT_RUN_ID: &str = "vault";

/// A frame as submitted for ingest; ids, version, signature, and
/// timestamps are assigned by the vault.
#[derive(Debug, Clone)]
pub struct NewFrame {
    pub scope: Scope,
    pub theme: String,
    pub summary: String,
    pub claims: Vec<String>,
    pub citations: Vec<String>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    pub ttl_ms: Option<u64>,
    pub pinned: bool,
    pub tags: Vec<String>,
    pub who: String,
    pub tools: Vec<String>,
    pub inputs: Vec<String>,
}

impl NewFrame {
    /// Minimal constructor; the optional fields default to empty.
    pub fn new(scope: Scope, theme: &str, summary: &str, who: &str) -> Self {
        Self {
            scope,
            theme: theme.to_string(),
            summary: summary.to_string(),
            claims: Vec::new(),
            citations: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            ttl_ms: None,
            pinned: false,
            tags: Vec::new(),
            who: who.to_string(),
            tools: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_claims(mut self, claims: Vec<String>) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// Selectors for [`MemoryVault::forget`].
#[derive(Debug, Clone, Default)]
pub struct ForgetSelectors {
    pub frame_ids: Vec<String>,
    pub theme: Option<String>,
    pub tag: Option<String>,
    pub scope: Option<Scope>,
}

/// The central knowledge store.
pub struct MemoryVault {
    store: FrameStore,
    config: VaultConfig,
    broker: MemoryBroker,
    events: Arc<EventBus>,
}

impl MemoryVault {
    pub fn new(store: FrameStore, config: VaultConfig, events: Arc<EventBus>) -> Self {
        Self { store, config, broker: MemoryBroker::new(), events }
    }

    pub fn open(
        path: &Path,
        config: VaultConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, VaultError> {
        let store = FrameStore::open(path).map_err(VaultError::Database)?;
        Ok(Self::new(store, config, events))
    }

    pub fn open_in_memory(
        config: VaultConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, VaultError> {
        let store = FrameStore::open_in_memory().map_err(VaultError::Database)?;
        Ok(Self::new(store, config, events))
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// Subscribe to vault notifications; the registration is also recorded
    /// durably.
    pub fn subscribe(
        &self,
        subscriber: &str,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Arc<MemoryEvent>>, VaultError> {
        self.store
            .add_subscription(subscriber, pattern)
            .map_err(VaultError::Database)?;
        Ok(self.broker.subscribe(pattern))
    }

    // ── Ingest ────────────────────────────────────────────────────────

    /// Ingest one frame through the guards: non-empty claims and
    /// citations, grounding above threshold, and no contradiction with
    /// existing knowledge on the theme.
    pub fn ingest_frame(&self, new: NewFrame) -> Result<KnowledgeFrame, VaultError> {
        if new.claims.is_empty() {
            return Err(VaultError::EmptyClaims);
        }
        if new.citations.is_empty() {
            return Err(VaultError::NoCitations);
        }

        let grounding =
            guards::check_grounding(&self.store, &new.claims, &new.citations, &self.config)
                .map_err(VaultError::Database)?;
        if !grounding.grounded {
            return Err(VaultError::Ungrounded {
                reason: grounding
                    .reason
                    .unwrap_or_else(|| "Grounding below threshold".to_string()),
            });
        }

        let conflicts = guards::find_contradictions(&self.store, &new.theme, &new.claims)
            .map_err(VaultError::Database)?;
        if !conflicts.is_empty() {
            return Err(VaultError::Contradiction { theme: new.theme });
        }

        let frame = self.build_frame(new);
        self.store.insert_frame(&frame).map_err(VaultError::Database)?;
        self.announce(broker::TOPIC_DELTA_CREATED, &frame)?;
        info!(frame_id = %frame.id, theme = %frame.theme, "frame ingested");
        Ok(frame)
    }

    /// Refinery: fission raw text into claims, fuse duplicates into the
    /// existing frame, validate the rest through the guards.
    pub fn ingest_and_refine(
        &self,
        raw: Vec<RawKnowledge>,
    ) -> Result<RefineReport, VaultError> {
        let mut report = RefineReport::default();
        for item in raw {
            let claims = refinery::fission(&item.text);
            if claims.is_empty() {
                report.rejected.push(RejectedKnowledge {
                    theme: item.theme.clone(),
                    reason: "No claims survive fission".to_string(),
                });
                continue;
            }
            if item.citations.is_empty() {
                report.rejected.push(RejectedKnowledge {
                    theme: item.theme.clone(),
                    reason: "No citations".to_string(),
                });
                continue;
            }

            // Fusion: an identical claim set on the same scope and theme
            // merges instead of duplicating.
            let fusion_key = KnowledgeFrame::fusion_key(item.scope, &item.theme, &claims);
            if let Some(mut existing) = self
                .store
                .find_by_fusion_key(&fusion_key)
                .map_err(VaultError::Database)?
            {
                for claim in claims {
                    if !existing.claims.contains(&claim) {
                        existing.claims.push(claim);
                    }
                }
                for citation in item.citations {
                    if !existing.citations.contains(&citation) {
                        existing.citations.push(citation);
                    }
                }
                existing.version = KnowledgeFrame::bump_patch(&existing.version);
                existing.updated_at = Utc::now();
                existing.provenance.signature = Some(existing.compute_signature());
                self.store.update_frame(&existing).map_err(VaultError::Database)?;
                self.announce(broker::TOPIC_DELTA_UPDATED, &existing)?;
                debug!(frame_id = %existing.id, "fused into existing frame");
                report.merged.push(existing.id);
                continue;
            }

            let conflicts = guards::find_contradictions(&self.store, &item.theme, &claims)
                .map_err(VaultError::Database)?;
            if !conflicts.is_empty() {
                report.rejected.push(RejectedKnowledge {
                    theme: item.theme.clone(),
                    reason: format!(
                        "Contradicts {} existing frame(s)",
                        conflicts.len()
                    ),
                });
                report.conflicts.extend(conflicts);
                continue;
            }

            let grounding =
                guards::check_grounding(&self.store, &claims, &item.citations, &self.config)
                    .map_err(VaultError::Database)?;
            if !grounding.grounded {
                report.rejected.push(RejectedKnowledge {
                    theme: item.theme.clone(),
                    reason: grounding
                        .reason
                        .unwrap_or_else(|| "Grounding below threshold".to_string()),
                });
                continue;
            }

            let summary = refinery::summarize(&claims, 140);
            let frame = self.build_frame(NewFrame {
                scope: item.scope,
                theme: item.theme,
                summary,
                claims,
                citations: item.citations,
                parents: Vec::new(),
                children: Vec::new(),
                ttl_ms: None,
                pinned: false,
                tags: item.tags,
                who: item.who,
                tools: Vec::new(),
                inputs: Vec::new(),
            });
            self.store.insert_frame(&frame).map_err(VaultError::Database)?;
            self.announce(broker::TOPIC_DELTA_CREATED, &frame)?;
            report.accepted.push(frame.id);
        }
        info!(
            accepted = report.accepted.len(),
            merged = report.merged.len(),
            rejected = report.rejected.len(),
            "refinery pass complete"
        );
        Ok(report)
    }

    pub fn ingest_qa_binding(
        &self,
        question: &str,
        answer: &str,
        validator_score: f64,
        grounding: f64,
        contradictions: u32,
        citations: Vec<String>,
        theme: &str,
    ) -> Result<(String, String), VaultError> {
        let (id, answer_id) = FrameStore::new_qa_ids();
        self.store
            .insert_qa_binding(&QaBinding {
                id: id.clone(),
                answer_id: answer_id.clone(),
                question: question.to_string(),
                answer: answer.to_string(),
                validator_score,
                grounding,
                contradictions,
                citations,
                theme: theme.to_string(),
            })
            .map_err(VaultError::Database)?;
        Ok((id, answer_id))
    }

    pub fn ingest_artifact(&self, artifact: ArtifactRecord) -> Result<(), VaultError> {
        self.store.insert_artifact(&artifact).map_err(VaultError::Database)?;
        self.events.publish(Event::new(
            if artifact.run_id.is_empty() { VAULT_RUN_ID } else { &artifact.run_id },
            EventPayload::ArtifactCreated {
                artifact_id: artifact.id,
                uri: artifact.uri,
                sha256: artifact.sha256,
            },
        ));
        Ok(())
    }

    pub fn ingest_signal(
        &self,
        name: &str,
        value: f64,
        phase: &str,
        run_id: &str,
    ) -> Result<(), VaultError> {
        self.store
            .insert_signal(name, value, phase, run_id)
            .map_err(VaultError::Database)
    }

    // ── Query ─────────────────────────────────────────────────────────

    /// Build a ranked, token-budgeted context pack.
    pub fn query(&self, query: &MemoryQuery) -> Result<ContextPack, VaultError> {
        pack::build_pack(&self.store, query, &self.config, Utc::now())
            .map_err(VaultError::Database)
    }

    /// Evaluate a memory gate over required themes.
    pub fn memory_gate(&self, spec: &MemoryGateSpec) -> Result<MemoryGateOutcome, VaultError> {
        gate::evaluate_gate(&self.store, spec, &self.config, Utc::now())
            .map_err(VaultError::Database)
    }

    // ── Admin ─────────────────────────────────────────────────────────

    /// Set the TTL for a scope (optionally one theme). Returns the number
    /// of frames touched.
    pub fn update_ttl(
        &self,
        scope: Scope,
        theme: Option<&str>,
        ttl_ms: u64,
    ) -> Result<usize, VaultError> {
        self.store
            .update_ttl(scope, theme, ttl_ms)
            .map_err(VaultError::Database)
    }

    pub fn pin(&self, frame_id: &str) -> Result<(), VaultError> {
        if !self.store.set_pinned(frame_id, true).map_err(VaultError::Database)? {
            return Err(VaultError::FrameNotFound { id: frame_id.to_string() });
        }
        Ok(())
    }

    /// Forget frames matching the selectors. Pinned frames are never
    /// deleted; the reason lands in the audit log. Returns the number of
    /// frames removed.
    pub fn forget(
        &self,
        selectors: &ForgetSelectors,
        reason: &str,
    ) -> Result<usize, VaultError> {
        let mut targets: Vec<KnowledgeFrame> = Vec::new();
        let mut push = |frame: KnowledgeFrame, targets: &mut Vec<KnowledgeFrame>| {
            if !targets.iter().any(|seen| seen.id == frame.id) {
                targets.push(frame);
            }
        };
        for id in &selectors.frame_ids {
            if let Some(frame) = self.store.get_frame(id).map_err(VaultError::Database)? {
                push(frame, &mut targets);
            }
        }
        if let Some(theme) = &selectors.theme {
            for frame in self.store.frames_by_theme(theme).map_err(VaultError::Database)? {
                push(frame, &mut targets);
            }
        }
        if let Some(tag) = &selectors.tag {
            for frame in self.store.frames_by_tag(tag).map_err(VaultError::Database)? {
                push(frame, &mut targets);
            }
        }
        if let Some(scope) = selectors.scope {
            for frame in self
                .store
                .frames_with_theme_prefix("", Some(scope), usize::MAX >> 1)
                .map_err(VaultError::Database)?
            {
                push(frame, &mut targets);
            }
        }

        let ids: Vec<String> = targets.iter().map(|frame| frame.id.clone()).collect();
        let deleted = self.store.delete_unpinned(&ids).map_err(VaultError::Database)?;
        self.store
            .record_audit("forget", &ids.join(","), reason)
            .map_err(VaultError::Database)?;
        for frame in targets.iter().filter(|frame| deleted.contains(&frame.id)) {
            self.announce(broker::TOPIC_DELTA_DELETED, frame)?;
        }
        if deleted.len() < ids.len() {
            warn!(
                requested = ids.len(),
                deleted = deleted.len(),
                "forget skipped pinned frames"
            );
        }
        info!(deleted = deleted.len(), reason, "forget executed");
        Ok(deleted.len())
    }

    /// Delete unpinned frames past their effective TTL. Returns the count
    /// removed.
    pub fn cleanup_expired(&self) -> Result<usize, VaultError> {
        let expired = self
            .store
            .expired_frames(&self.config, Utc::now())
            .map_err(VaultError::Database)?;
        let ids: Vec<String> = expired.iter().map(|frame| frame.id.clone()).collect();
        let deleted = self.store.delete_unpinned(&ids).map_err(VaultError::Database)?;
        for frame in expired.iter().filter(|frame| deleted.contains(&frame.id)) {
            self.announce(broker::TOPIC_DELTA_DELETED, frame)?;
        }
        Ok(deleted.len())
    }

    fn build_frame(&self, new: NewFrame) -> KnowledgeFrame {
        let now = Utc::now();
        let mut frame = KnowledgeFrame {
            id: FrameStore::new_frame_id(),
            scope: new.scope,
            theme: new.theme,
            summary: new.summary,
            claims: new.claims,
            citations: new.citations,
            parents: new.parents,
            children: new.children,
            version: "1.0.0".to_string(),
            provenance: Provenance {
                who: new.who,
                when: now,
                tools: new.tools,
                inputs: new.inputs,
                signature: None,
            },
            created_at: now,
            updated_at: now,
            ttl_ms: new.ttl_ms,
            pinned: new.pinned,
            tags: new.tags,
        };
        frame.provenance.signature = Some(frame.compute_signature());
        frame
    }

    /// Record the delta row, notify broker subscribers, and mirror onto
    /// the engine event trail.
    fn announce(&self, topic: &str, frame: &KnowledgeFrame) -> Result<(), VaultError> {
        let action = topic.rsplit('.').next().unwrap_or(topic);
        self.store
            .record_delta(action, &frame.id, &frame.theme)
            .map_err(VaultError::Database)?;
        self.broker.publish(MemoryEvent::now(topic, &frame.id, &frame.theme));
        let payload = match action {
            "created" => EventPayload::MemoryDeltaCreated {
                frame_id: frame.id.clone(),
                theme: frame.theme.clone(),
            },
            "updated" => EventPayload::MemoryDeltaUpdated {
                frame_id: frame.id.clone(),
                theme: frame.theme.clone(),
            },
            _ => EventPayload::MemoryDeltaDeleted {
                frame_id: frame.id.clone(),
                theme: frame.theme.clone(),
            },
        };
        self.events.publish(Event::new(VAULT_RUN_ID, payload));
        Ok(())
    }
}
