//! SQLite persistence for the memory vault: frames, QA bindings,
//! artifacts, signals, deltas, subscriptions, and the audit log.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::repo::migrations::{self, Migration};

use super::frame::{KnowledgeFrame, Provenance, Scope};

const VAULT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create-frame-tables",
        sql: "
            CREATE TABLE knowledge_frames (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                theme TEXT NOT NULL,
                summary TEXT NOT NULL,
                claims TEXT NOT NULL,
                citations TEXT NOT NULL,
                parents TEXT NOT NULL DEFAULT '[]',
                children TEXT NOT NULL DEFAULT '[]',
                version TEXT NOT NULL,
                provenance TEXT NOT NULL,
                fusion_key TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                ttl_ms INTEGER,
                pinned INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE frame_tags (
                frame_id TEXT NOT NULL REFERENCES knowledge_frames(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (frame_id, tag)
            );

            CREATE INDEX idx_frames_scope_theme ON knowledge_frames(scope, theme);
            CREATE INDEX idx_frames_created ON knowledge_frames(created_at);
            CREATE INDEX idx_frames_fusion ON knowledge_frames(fusion_key);
            CREATE INDEX idx_frames_pinned ON knowledge_frames(pinned) WHERE pinned = 1;
            CREATE INDEX idx_frame_tags_tag ON frame_tags(tag);
        ",
    },
    Migration {
        version: 2,
        name: "create-side-channels",
        sql: "
            CREATE TABLE qa_bindings (
                id TEXT PRIMARY KEY,
                answer_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                validator_score REAL NOT NULL,
                grounding REAL NOT NULL,
                contradictions INTEGER NOT NULL DEFAULT 0,
                citations TEXT NOT NULL DEFAULT '[]',
                theme TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE artifacts (
                id TEXT PRIMARY KEY,
                artifact_type TEXT NOT NULL,
                uri TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                phase TEXT NOT NULL DEFAULT '',
                run_id TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                value REAL NOT NULL,
                phase TEXT NOT NULL DEFAULT '',
                run_id TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );

            CREATE TABLE memory_deltas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                frame_id TEXT NOT NULL,
                theme TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE memory_subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subscriber TEXT NOT NULL,
                pattern TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE vault_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                selector TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_qa_answer ON qa_bindings(answer_id);
            CREATE INDEX idx_artifacts_uri ON artifacts(uri);
            CREATE INDEX idx_signals_name ON signals(name);
        ",
    },
    Migration {
        version: 3,
        name: "create-views",
        sql: "
            CREATE VIEW v_knowledge_coverage AS
                SELECT scope, theme, COUNT(*) AS frames,
                       SUM(pinned) AS pinned_frames,
                       MAX(updated_at) AS last_updated
                FROM knowledge_frames GROUP BY scope, theme;

            CREATE VIEW v_qa_quality AS
                SELECT theme, COUNT(*) AS bindings,
                       AVG(validator_score) AS avg_validator_score,
                       AVG(grounding) AS avg_grounding,
                       SUM(contradictions) AS total_contradictions
                FROM qa_bindings GROUP BY theme;

            CREATE VIEW v_signal_aggregates AS
                SELECT name, COUNT(*) AS samples, AVG(value) AS avg_value,
                       MAX(created_at) AS last_seen
                FROM signals GROUP BY name;
        ",
    },
];

const FRAME_COLUMNS: &str = "id, scope, theme, summary, claims, citations, parents, children, \
     version, provenance, fusion_key, tags, created_at, updated_at, ttl_ms, pinned";

/// A stored QA binding.
#[derive(Debug, Clone)]
pub struct QaBinding {
    pub id: String,
    pub answer_id: String,
    pub question: String,
    pub answer: String,
    pub validator_score: f64,
    pub grounding: f64,
    pub contradictions: u32,
    pub citations: Vec<String>,
    pub theme: String,
}

/// A stored artifact reference.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub id: String,
    pub artifact_type: String,
    pub uri: String,
    pub sha256: String,
    pub phase: String,
    pub run_id: String,
}

/// SQLite store behind the vault.
pub struct FrameStore {
    conn: Mutex<Connection>,
}

impl FrameStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open vault database")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory vault database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        migrations::apply(&mut conn, VAULT_MIGRATIONS)
            .context("Failed to run vault migrations")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("frame store lock")
    }

    // ── Frames ────────────────────────────────────────────────────────

    pub fn insert_frame(&self, frame: &KnowledgeFrame) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin frame insert")?;
        tx.execute(
            &format!(
                "INSERT INTO knowledge_frames ({FRAME_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                frame.id,
                frame.scope.as_str(),
                frame.theme,
                frame.summary,
                serde_json::to_string(&frame.claims)?,
                serde_json::to_string(&frame.citations)?,
                serde_json::to_string(&frame.parents)?,
                serde_json::to_string(&frame.children)?,
                frame.version,
                serde_json::to_string(&frame.provenance)?,
                KnowledgeFrame::fusion_key(frame.scope, &frame.theme, &frame.claims),
                serde_json::to_string(&frame.tags)?,
                frame.created_at.timestamp_millis(),
                frame.updated_at.timestamp_millis(),
                frame.ttl_ms.map(|t| t as i64),
                frame.pinned,
            ],
        )
        .context("Failed to insert frame")?;
        for tag in &frame.tags {
            tx.execute(
                "INSERT OR IGNORE INTO frame_tags (frame_id, tag) VALUES (?1, ?2)",
                params![frame.id, tag],
            )
            .context("Failed to insert frame tag")?;
        }
        tx.commit().context("Failed to commit frame insert")
    }

    /// Replace a frame's stored state (fusion updates, admin edits).
    pub fn update_frame(&self, frame: &KnowledgeFrame) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin frame update")?;
        let changed = tx
            .execute(
                "UPDATE knowledge_frames SET scope = ?2, theme = ?3, summary = ?4, \
                 claims = ?5, citations = ?6, parents = ?7, children = ?8, version = ?9, \
                 provenance = ?10, fusion_key = ?11, tags = ?12, created_at = ?13, \
                 updated_at = ?14, ttl_ms = ?15, pinned = ?16 WHERE id = ?1",
                params![
                    frame.id,
                    frame.scope.as_str(),
                    frame.theme,
                    frame.summary,
                    serde_json::to_string(&frame.claims)?,
                    serde_json::to_string(&frame.citations)?,
                    serde_json::to_string(&frame.parents)?,
                    serde_json::to_string(&frame.children)?,
                    frame.version,
                    serde_json::to_string(&frame.provenance)?,
                    KnowledgeFrame::fusion_key(frame.scope, &frame.theme, &frame.claims),
                    serde_json::to_string(&frame.tags)?,
                    frame.created_at.timestamp_millis(),
                    frame.updated_at.timestamp_millis(),
                    frame.ttl_ms.map(|t| t as i64),
                    frame.pinned,
                ],
            )
            .context("Failed to update frame")?;
        anyhow::ensure!(changed == 1, "Frame {} not found", frame.id);
        tx.execute("DELETE FROM frame_tags WHERE frame_id = ?1", params![frame.id])
            .context("Failed to clear frame tags")?;
        for tag in &frame.tags {
            tx.execute(
                "INSERT OR IGNORE INTO frame_tags (frame_id, tag) VALUES (?1, ?2)",
                params![frame.id, tag],
            )
            .context("Failed to insert frame tag")?;
        }
        tx.commit().context("Failed to commit frame update")
    }

    pub fn get_frame(&self, id: &str) -> Result<Option<KnowledgeFrame>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {FRAME_COLUMNS} FROM knowledge_frames WHERE id = ?1"))
            .context("Failed to prepare get_frame")?;
        stmt.query_row(params![id], row_to_frame)
            .optional()
            .context("Failed to query frame")
    }

    pub fn find_by_fusion_key(&self, fusion_key: &str) -> Result<Option<KnowledgeFrame>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FRAME_COLUMNS} FROM knowledge_frames WHERE fusion_key = ?1"
            ))
            .context("Failed to prepare find_by_fusion_key")?;
        stmt.query_row(params![fusion_key], row_to_frame)
            .optional()
            .context("Failed to query fusion key")
    }

    /// Frames whose theme matches exactly (contradiction guard pool).
    pub fn frames_by_theme(&self, theme: &str) -> Result<Vec<KnowledgeFrame>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FRAME_COLUMNS} FROM knowledge_frames WHERE theme = ?1 ORDER BY id"
            ))
            .context("Failed to prepare frames_by_theme")?;
        collect_frames(stmt.query_map(params![theme], row_to_frame))
    }

    /// Frames whose theme starts with `prefix`, optionally restricted to a
    /// scope, newest first, capped at `limit`.
    pub fn frames_with_theme_prefix(
        &self,
        prefix: &str,
        scope: Option<Scope>,
        limit: usize,
    ) -> Result<Vec<KnowledgeFrame>> {
        let conn = self.lock();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        match scope {
            Some(scope) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {FRAME_COLUMNS} FROM knowledge_frames \
                         WHERE theme LIKE ?1 ESCAPE '\\' AND scope = ?2 \
                         ORDER BY created_at DESC LIMIT ?3"
                    ))
                    .context("Failed to prepare theme prefix query")?;
                collect_frames(stmt.query_map(
                    params![pattern, scope.as_str(), limit as i64],
                    row_to_frame,
                ))
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {FRAME_COLUMNS} FROM knowledge_frames \
                         WHERE theme LIKE ?1 ESCAPE '\\' \
                         ORDER BY created_at DESC LIMIT ?2"
                    ))
                    .context("Failed to prepare theme prefix query")?;
                collect_frames(stmt.query_map(params![pattern, limit as i64], row_to_frame))
            }
        }
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) -> Result<bool> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE knowledge_frames SET pinned = ?1, updated_at = ?2 WHERE id = ?3",
                params![pinned, now_ms(), id],
            )
            .context("Failed to set pinned")?;
        Ok(changed == 1)
    }

    /// Set the TTL for every frame in a scope (optionally one theme).
    /// Returns the number of frames touched.
    pub fn update_ttl(&self, scope: Scope, theme: Option<&str>, ttl_ms: u64) -> Result<usize> {
        let conn = self.lock();
        let changed = match theme {
            Some(theme) => conn.execute(
                "UPDATE knowledge_frames SET ttl_ms = ?1, updated_at = ?2 \
                 WHERE scope = ?3 AND theme = ?4",
                params![ttl_ms as i64, now_ms(), scope.as_str(), theme],
            ),
            None => conn.execute(
                "UPDATE knowledge_frames SET ttl_ms = ?1, updated_at = ?2 WHERE scope = ?3",
                params![ttl_ms as i64, now_ms(), scope.as_str()],
            ),
        }
        .context("Failed to update ttl")?;
        Ok(changed)
    }

    /// Delete the given frames, skipping pinned ones. Returns the ids
    /// actually deleted.
    pub fn delete_unpinned(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin delete")?;
        let mut deleted = Vec::new();
        for id in ids {
            let changed = tx
                .execute(
                    "DELETE FROM knowledge_frames WHERE id = ?1 AND pinned = 0",
                    params![id],
                )
                .context("Failed to delete frame")?;
            if changed == 1 {
                deleted.push(id.clone());
            }
        }
        tx.commit().context("Failed to commit delete")?;
        Ok(deleted)
    }

    /// Unpinned frames past their effective TTL.
    pub fn expired_frames(
        &self,
        config: &VaultConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeFrame>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FRAME_COLUMNS} FROM knowledge_frames WHERE pinned = 0"
            ))
            .context("Failed to prepare expired_frames")?;
        let frames = collect_frames(stmt.query_map([], row_to_frame))?;
        Ok(frames
            .into_iter()
            .filter(|frame| {
                let age_ms = (now - frame.created_at).num_milliseconds().max(0) as u64;
                age_ms >= frame.effective_ttl_ms(config)
            })
            .collect())
    }

    /// Frames carrying a given tag.
    pub fn frames_by_tag(&self, tag: &str) -> Result<Vec<KnowledgeFrame>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FRAME_COLUMNS} FROM knowledge_frames WHERE id IN \
                 (SELECT frame_id FROM frame_tags WHERE tag = ?1) ORDER BY id"
            ))
            .context("Failed to prepare frames_by_tag")?;
        collect_frames(stmt.query_map(params![tag], row_to_frame))
    }

    // ── Deltas, subscriptions, audit ──────────────────────────────────

    pub fn record_delta(&self, action: &str, frame_id: &str, theme: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO memory_deltas (action, frame_id, theme, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![action, frame_id, theme, now_ms()],
        )
        .context("Failed to record delta")?;
        Ok(())
    }

    pub fn delta_count(&self, action: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_deltas WHERE action = ?1",
                params![action],
                |row| row.get(0),
            )
            .context("Failed to count deltas")?;
        Ok(count as usize)
    }

    pub fn add_subscription(&self, subscriber: &str, pattern: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO memory_subscriptions (subscriber, pattern, created_at) \
             VALUES (?1, ?2, ?3)",
            params![subscriber, pattern, now_ms()],
        )
        .context("Failed to add subscription")?;
        Ok(())
    }

    pub fn record_audit(&self, action: &str, selector: &str, reason: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO vault_audit (action, selector, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![action, selector, reason, now_ms()],
        )
        .context("Failed to record audit")?;
        Ok(())
    }

    pub fn audit_entries(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT action, selector, reason FROM vault_audit ORDER BY id")
            .context("Failed to prepare audit_entries")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .context("Failed to query audit")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read audit row")?);
        }
        Ok(entries)
    }

    // ── Side-channel ingests ──────────────────────────────────────────

    pub fn insert_qa_binding(&self, binding: &QaBinding) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO qa_bindings (id, answer_id, question, answer, validator_score, \
             grounding, contradictions, citations, theme, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                binding.id,
                binding.answer_id,
                binding.question,
                binding.answer,
                binding.validator_score,
                binding.grounding,
                binding.contradictions,
                serde_json::to_string(&binding.citations)?,
                binding.theme,
                now_ms()
            ],
        )
        .context("Failed to insert qa binding")?;
        Ok(())
    }

    pub fn qa_citation_exists(&self, citation: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM qa_bindings WHERE id = ?1 OR answer_id = ?1",
                params![citation],
                |row| row.get(0),
            )
            .context("Failed to check qa citation")?;
        Ok(count > 0)
    }

    pub fn insert_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO artifacts \
             (id, artifact_type, uri, sha256, phase, run_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.id,
                artifact.artifact_type,
                artifact.uri,
                artifact.sha256,
                artifact.phase,
                artifact.run_id,
                now_ms()
            ],
        )
        .context("Failed to insert artifact")?;
        Ok(())
    }

    pub fn artifact_exists(&self, id_or_uri: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM artifacts WHERE id = ?1 OR uri = ?1",
                params![id_or_uri],
                |row| row.get(0),
            )
            .context("Failed to check artifact")?;
        Ok(count > 0)
    }

    pub fn insert_signal(&self, name: &str, value: f64, phase: &str, run_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO signals (name, value, phase, run_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, value, phase, run_id, now_ms()],
        )
        .context("Failed to insert signal")?;
        Ok(())
    }

    /// Coverage view rows: `(scope, theme, frames, pinned_frames)`.
    pub fn knowledge_coverage(&self) -> Result<Vec<(String, String, i64, i64)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT scope, theme, frames, pinned_frames FROM v_knowledge_coverage \
                 ORDER BY scope, theme",
            )
            .context("Failed to prepare coverage query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .context("Failed to query coverage")?;
        let mut coverage = Vec::new();
        for row in rows {
            coverage.push(row.context("Failed to read coverage row")?);
        }
        Ok(coverage)
    }

    /// Fresh id for a new frame.
    pub fn new_frame_id() -> String {
        format!("frame_{}", Uuid::new_v4().simple())
    }

    /// Fresh id pair for a QA binding.
    pub fn new_qa_ids() -> (String, String) {
        let id = Uuid::new_v4().simple().to_string();
        (format!("q_{id}"), format!("a_{id}"))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn collect_frames(
    rows: rusqlite::Result<impl Iterator<Item = rusqlite::Result<KnowledgeFrame>>>,
) -> Result<Vec<KnowledgeFrame>> {
    let rows = rows.context("Failed to query frames")?;
    let mut frames = Vec::new();
    for row in rows {
        frames.push(row.context("Failed to read frame row")?);
    }
    Ok(frames)
}

fn row_to_frame(row: &Row<'_>) -> rusqlite::Result<KnowledgeFrame> {
    let scope: String = row.get(1)?;
    let claims: String = row.get(4)?;
    let citations: String = row.get(5)?;
    let parents: String = row.get(6)?;
    let children: String = row.get(7)?;
    let provenance: String = row.get(9)?;
    let tags: String = row.get(11)?;
    let created_ms: i64 = row.get(12)?;
    let updated_ms: i64 = row.get(13)?;
    Ok(KnowledgeFrame {
        id: row.get(0)?,
        scope: Scope::parse(&scope).unwrap_or(Scope::Ephemeral),
        theme: row.get(2)?,
        summary: row.get(3)?,
        claims: serde_json::from_str(&claims).unwrap_or_default(),
        citations: serde_json::from_str(&citations).unwrap_or_default(),
        parents: serde_json::from_str(&parents).unwrap_or_default(),
        children: serde_json::from_str(&children).unwrap_or_default(),
        version: row.get(8)?,
        provenance: serde_json::from_str(&provenance).unwrap_or(Provenance {
            who: String::new(),
            when: Utc::now(),
            tools: vec![],
            inputs: vec![],
            signature: None,
        }),
        created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap_or_else(Utc::now),
        updated_at: Utc.timestamp_millis_opt(updated_ms).single().unwrap_or_else(Utc::now),
        ttl_ms: row.get::<_, Option<i64>>(14)?.map(|t| t as u64),
        pinned: row.get(15)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_frame(id: &str, theme: &str, scope: Scope) -> KnowledgeFrame {
        let now = Utc::now();
        KnowledgeFrame {
            id: id.to_string(),
            scope,
            theme: theme.to_string(),
            summary: format!("Summary of {theme}"),
            claims: vec![format!("{theme} has a documented behaviour")],
            citations: vec!["https://example.com/doc".into()],
            parents: vec![],
            children: vec![],
            version: "1.0.0".into(),
            provenance: Provenance {
                who: "qa-writer".into(),
                when: now,
                tools: vec!["search".into()],
                inputs: vec![],
                signature: None,
            },
            created_at: now,
            updated_at: now,
            ttl_ms: None,
            pinned: false,
            tags: vec!["seed".into()],
        }
    }

    #[test]
    fn test_insert_and_round_trip() {
        let store = FrameStore::open_in_memory().unwrap();
        let frame = sample_frame("frame_a", "pricing", Scope::Run);
        store.insert_frame(&frame).unwrap();

        let loaded = store.get_frame("frame_a").unwrap().unwrap();
        assert_eq!(loaded.theme, "pricing");
        assert_eq!(loaded.claims, frame.claims);
        assert_eq!(loaded.tags, vec!["seed".to_string()]);
        assert_eq!(loaded.provenance.who, "qa-writer");
    }

    #[test]
    fn test_fusion_key_lookup() {
        let store = FrameStore::open_in_memory().unwrap();
        let frame = sample_frame("frame_a", "pricing", Scope::Run);
        store.insert_frame(&frame).unwrap();

        let key = KnowledgeFrame::fusion_key(frame.scope, &frame.theme, &frame.claims);
        assert!(store.find_by_fusion_key(&key).unwrap().is_some());
        assert!(store.find_by_fusion_key("missing").unwrap().is_none());
    }

    #[test]
    fn test_theme_prefix_and_scope_filters() {
        let store = FrameStore::open_in_memory().unwrap();
        store.insert_frame(&sample_frame("frame_a", "pricing.tiers", Scope::Run)).unwrap();
        store.insert_frame(&sample_frame("frame_b", "pricing.discounts", Scope::Tenant)).unwrap();
        store.insert_frame(&sample_frame("frame_c", "billing", Scope::Run)).unwrap();

        assert_eq!(store.frames_with_theme_prefix("pricing", None, 10).unwrap().len(), 2);
        assert_eq!(
            store.frames_with_theme_prefix("pricing", Some(Scope::Tenant), 10).unwrap().len(),
            1
        );
        assert_eq!(store.frames_by_theme("billing").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_skips_pinned() {
        let store = FrameStore::open_in_memory().unwrap();
        let mut pinned = sample_frame("frame_a", "pricing", Scope::Run);
        pinned.pinned = true;
        store.insert_frame(&pinned).unwrap();
        store.insert_frame(&sample_frame("frame_b", "pricing", Scope::Run)).unwrap();

        let deleted = store
            .delete_unpinned(&["frame_a".to_string(), "frame_b".to_string()])
            .unwrap();
        assert_eq!(deleted, vec!["frame_b".to_string()]);
        assert!(store.get_frame("frame_a").unwrap().is_some());
    }

    #[test]
    fn test_expired_frames_respect_pin_and_ttl() {
        let store = FrameStore::open_in_memory().unwrap();
        let config = VaultConfig::default();

        let mut stale = sample_frame("frame_stale", "pricing", Scope::Run);
        stale.ttl_ms = Some(10);
        stale.created_at = Utc::now() - chrono::Duration::seconds(5);
        let mut pinned = stale.clone();
        pinned.id = "frame_pinned".into();
        pinned.pinned = true;
        store.insert_frame(&stale).unwrap();
        store.insert_frame(&pinned).unwrap();
        store.insert_frame(&sample_frame("frame_fresh", "pricing", Scope::Run)).unwrap();

        let expired = store.expired_frames(&config, Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "frame_stale");
    }

    #[test]
    fn test_update_ttl_scoped_and_themed() {
        let store = FrameStore::open_in_memory().unwrap();
        store.insert_frame(&sample_frame("frame_a", "pricing", Scope::Run)).unwrap();
        store.insert_frame(&sample_frame("frame_b", "billing", Scope::Run)).unwrap();
        store.insert_frame(&sample_frame("frame_c", "pricing", Scope::Tenant)).unwrap();

        assert_eq!(store.update_ttl(Scope::Run, Some("pricing"), 1_000).unwrap(), 1);
        assert_eq!(store.update_ttl(Scope::Run, None, 2_000).unwrap(), 2);
        assert_eq!(store.get_frame("frame_c").unwrap().unwrap().ttl_ms, None);
    }

    #[test]
    fn test_qa_and_artifact_citation_checks() {
        let store = FrameStore::open_in_memory().unwrap();
        let (q_id, a_id) = FrameStore::new_qa_ids();
        store
            .insert_qa_binding(&QaBinding {
                id: q_id.clone(),
                answer_id: a_id.clone(),
                question: "Is the base tier free?".into(),
                answer: "Yes".into(),
                validator_score: 0.9,
                grounding: 0.8,
                contradictions: 0,
                citations: vec!["https://example.com".into()],
                theme: "pricing".into(),
            })
            .unwrap();
        assert!(store.qa_citation_exists(&q_id).unwrap());
        assert!(store.qa_citation_exists(&a_id).unwrap());
        assert!(!store.qa_citation_exists("q_missing").unwrap());

        store
            .insert_artifact(&ArtifactRecord {
                id: "art-1".into(),
                artifact_type: "report".into(),
                uri: "s3://bucket/report.md".into(),
                sha256: "00".into(),
                phase: "QA".into(),
                run_id: "run-1".into(),
            })
            .unwrap();
        assert!(store.artifact_exists("art-1").unwrap());
        assert!(store.artifact_exists("s3://bucket/report.md").unwrap());
        assert!(!store.artifact_exists("other").unwrap());
    }

    #[test]
    fn test_coverage_view() {
        let store = FrameStore::open_in_memory().unwrap();
        store.insert_frame(&sample_frame("frame_a", "pricing", Scope::Run)).unwrap();
        let mut pinned = sample_frame("frame_b", "pricing", Scope::Run);
        pinned.pinned = true;
        store.insert_frame(&pinned).unwrap();

        let coverage = store.knowledge_coverage().unwrap();
        assert_eq!(coverage.len(), 1);
        let (scope, theme, frames, pinned_frames) = &coverage[0];
        assert_eq!(scope, "run");
        assert_eq!(theme, "pricing");
        assert_eq!(*frames, 2);
        assert_eq!(*pinned_frames, 1);
    }
}
