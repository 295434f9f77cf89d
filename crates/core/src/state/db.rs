//! # ThinkTank Database
//!
//! Single SQLite database for runs, stage outputs and prompt templates,
//! stored at `.thinktank/thinktank.db` by default.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::capabilities::prompts;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Runs, their stage/task rows and the prompt table
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    goal TEXT NOT NULL,
    context TEXT,
    status TEXT NOT NULL,
    aggregate_result TEXT NOT NULL DEFAULT '',
    failure_stage TEXT,
    failure_reason TEXT,
    failure_message TEXT,
    warnings_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

-- task rows hang off the planning row via parent_id
CREATE TABLE IF NOT EXISTS stage_outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    parent_id INTEGER REFERENCES stage_outputs(id),
    position INTEGER NOT NULL,
    kind TEXT NOT NULL DEFAULT 'stage',
    stage TEXT NOT NULL,
    marker TEXT NOT NULL,
    title TEXT,
    raw TEXT,
    parsed_json TEXT,
    ok INTEGER NOT NULL DEFAULT 0,
    error_detail TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prompt_templates (
    slug TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
CREATE INDEX IF NOT EXISTS idx_stage_outputs_run ON stage_outputs(run_id, position);
CREATE INDEX IF NOT EXISTS idx_stage_outputs_parent ON stage_outputs(parent_id);
"#;

/// Default on-disk location
pub const DEFAULT_DB_PATH: &str = ".thinktank/thinktank.db";

/// Database manager shared by the run store and the prompt library
pub struct ThinkTankDb {
    conn: Arc<Mutex<Connection>>,
}

impl ThinkTankDb {
    /// Open database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open thinktank database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

        let current: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        if current < 1 {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(SCHEMA_V1)?;
            tx.execute("INSERT OR REPLACE INTO schema_version (version) VALUES (?1)", [1])?;
            tx.commit()?;
            tracing::info!("ThinkTankDb migrated to schema version {}", SCHEMA_VERSION);
        }

        Ok(())
    }

    // =========================================================================
    // Prompt Template Methods
    // =========================================================================

    /// Insert bundled defaults for every role that has no row yet
    pub fn seed_prompts(&self) -> Result<usize> {
        let conn = self.lock()?;
        let mut inserted = 0;
        for (slug, content) in prompts::all_defaults() {
            inserted += conn.execute(
                "INSERT OR IGNORE INTO prompt_templates (slug, version, content) VALUES (?1, 1, ?2)",
                params![slug, content],
            )?;
        }

        if inserted > 0 {
            tracing::info!("Seeded {} default prompts", inserted);
        }
        Ok(inserted)
    }

    pub fn get_prompt(&self, slug: &str) -> Result<String> {
        self.get_prompt_versioned(slug).map(|(content, _)| content)
    }

    /// Current content and version of a prompt
    pub fn get_prompt_versioned(&self, slug: &str) -> Result<(String, i32)> {
        self.lock()?
            .query_row(
                "SELECT content, version FROM prompt_templates WHERE slug = ?1",
                params![slug],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("Prompt '{}' not found", slug))
    }

    /// Replace a prompt; returns the new version (1 for a new slug)
    pub fn set_prompt(&self, slug: &str, content: &str) -> Result<i32> {
        let version = self.lock()?.query_row(
            r#"
            INSERT INTO prompt_templates (slug, version, content) VALUES (?1, 1, ?2)
            ON CONFLICT(slug) DO UPDATE SET
                version = prompt_templates.version + 1,
                content = excluded.content,
                updated_at = datetime('now')
            RETURNING version
            "#,
            params![slug, content],
            |row| row.get(0),
        )?;

        tracing::debug!(%slug, version, "Prompt updated");
        Ok(version)
    }

    /// All prompt slugs with their versions, sorted by slug
    pub fn list_prompts(&self) -> Result<Vec<(String, i32)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT slug, version FROM prompt_templates ORDER BY slug")?;
        let prompts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prompts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityRole, PromptLibrary};

    fn table_names(db: &ThinkTankDb) -> Vec<String> {
        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        names
    }

    #[test]
    fn test_open_creates_tables() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let tables = table_names(&db);

        assert!(tables.contains(&"runs".to_string()));
        assert!(tables.contains(&"stage_outputs".to_string()));
        assert!(tables.contains(&"prompt_templates".to_string()));
    }

    #[test]
    fn test_schema_version_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("thinktank.db");

        // Open twice - should not fail on second open
        drop(ThinkTankDb::open_at(&path).unwrap());
        let db = ThinkTankDb::open_at(&path).unwrap();

        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_seed_and_version_prompts() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        assert_eq!(db.seed_prompts().unwrap(), 7);
        assert_eq!(db.seed_prompts().unwrap(), 0);

        let (_, version) = db.get_prompt_versioned("researcher").unwrap();
        assert_eq!(version, 1);

        let version = db.set_prompt("researcher", "调研 {{project_scope}}").unwrap();
        assert_eq!(version, 2);
        assert_eq!(db.get_prompt("researcher").unwrap(), "调研 {{project_scope}}");
        assert!(db.get_prompt("missing").is_err());
    }

    #[test]
    fn test_prompt_library_prefers_database() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        db.seed_prompts().unwrap();
        db.set_prompt("evaluator", "评估 {{goal}}").unwrap();
        db.set_prompt("not_a_role", "ignored").unwrap();

        let library = PromptLibrary::load(&db).unwrap();
        assert_eq!(library.template(CapabilityRole::Evaluator), "评估 {{goal}}");
        assert_eq!(
            library.template(CapabilityRole::Researcher),
            prompts::RESEARCHER
        );
    }
}
