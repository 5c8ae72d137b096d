//! Numbered schema migrations with a `schema_migrations` registry.
//!
//! Each database (engine store, vault store) owns its migration list;
//! `apply` runs the not-yet-applied suffix inside a transaction per
//! migration.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// One schema migration step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Apply all migrations newer than the recorded schema version.
pub fn apply(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .context("Failed to create schema_migrations")?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .context("Failed to read schema version")?;

    for migration in migrations.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction()
            .with_context(|| format!("Failed to begin migration {}", migration.version))?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("Migration {} ({}) failed", migration.version, migration.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, chrono::Utc::now().timestamp_millis()],
        )
        .with_context(|| format!("Failed to record migration {}", migration.version))?;
        tx.commit()
            .with_context(|| format!("Failed to commit migration {}", migration.version))?;
    }
    Ok(())
}
