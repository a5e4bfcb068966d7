//! SQLite persistence for videos, checkpoints, and artifacts.
//!
//! `Db` owns the connection and exposes synchronous query methods, split
//! across `videos`, `checkpoints`, and `artifacts` by concern. `DbHandle`
//! is the async-facing wrapper: it serialises access behind a mutex and
//! runs closures on a blocking thread so handlers never block the
//! executor. Every write is a single statement; there are no long-held
//! transactions.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::Connection;

pub mod artifacts;
pub mod checkpoints;
pub mod models;
pub mod videos;

pub use models::*;

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS videos (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    current_phase INTEGER NOT NULL DEFAULT 0,
                    progress REAL NOT NULL DEFAULT 0,
                    auto_continue INTEGER NOT NULL DEFAULT 0,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    error_message TEXT,
                    spec TEXT,
                    assets TEXT NOT NULL DEFAULT '[]',
                    chunk_urls TEXT NOT NULL DEFAULT '[]',
                    stitched_url TEXT,
                    final_video_url TEXT,
                    final_music_url TEXT,
                    thumbnail_url TEXT,
                    phase_outputs TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    id TEXT PRIMARY KEY,
                    video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
                    branch_name TEXT NOT NULL,
                    phase_number INTEGER NOT NULL CHECK (phase_number BETWEEN 1 AND 4),
                    version INTEGER NOT NULL,
                    parent_checkpoint_id TEXT REFERENCES checkpoints(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    approved_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    phase_output TEXT NOT NULL DEFAULT '{}',
                    cost_usd REAL NOT NULL DEFAULT 0,
                    owner_id TEXT NOT NULL,
                    edit_description TEXT,
                    UNIQUE(video_id, branch_name, phase_number, version)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id TEXT PRIMARY KEY,
                    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
                    artifact_type TEXT NOT NULL,
                    artifact_key TEXT NOT NULL,
                    blob_url TEXT NOT NULL,
                    blob_key TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    parent_artifact_id TEXT,
                    metadata TEXT,
                    size_bytes INTEGER,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    UNIQUE(checkpoint_id, artifact_type, artifact_key, version)
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_video ON checkpoints(video_id);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_video_branch ON checkpoints(video_id, branch_name);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_parent ON checkpoints(parent_checkpoint_id);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
                CREATE INDEX IF NOT EXISTS idx_artifacts_checkpoint ON artifacts(checkpoint_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(artifact_type);
                CREATE INDEX IF NOT EXISTS idx_artifacts_parent ON artifacts(parent_artifact_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }
}

/// Cloneable async handle over the store. Queries run via `call` on a
/// blocking thread while the caller awaits.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let db = inner.lock().map_err(|_| anyhow!("Database lock poisoned"))?;
            f(&db)
        })
        .await
        .context("Database task panicked")?
    }

    /// Synchronous access for startup and tests.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, Db>> {
        self.inner.lock().map_err(|_| anyhow!("Database lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_all_tables_and_indexes() -> Result<()> {
        let db = Db::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('videos', 'checkpoints', 'artifacts')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3, "Expected 3 tables to exist");

        let index_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 7, "Expected 7 indexes to exist");

        Ok(())
    }

    #[tokio::test]
    async fn handle_call_runs_closures() -> Result<()> {
        let handle = DbHandle::new(Db::new_in_memory()?);
        let count: i64 = handle
            .call(|db| {
                db.conn
                    .query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))
                    .context("count failed")
            })
            .await?;
        assert_eq!(count, 0);
        Ok(())
    }
}
