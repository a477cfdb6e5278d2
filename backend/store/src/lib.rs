//! SQLite system of record for the JobForge engine.
//!
//! One `SqliteStore` implements every store role the engine consumes: module
//! registry, job and schedule tables, execution records, and the durable work
//! queue with its recurring registrations. The connection sits behind an async
//! mutex so each trait method is a single serialized unit of work.
//!
//! Handlers get `SqliteDatabase` instead, a separate connection on its own file.

mod database;
mod executions;
mod jobs;
mod queue;

pub use database::SqliteDatabase;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use jobforge_core::{StoreError, Stores};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS modules (
    id        TEXT PRIMARY KEY,
    name      TEXT NOT NULL,
    root_dir  TEXT NOT NULL,
    enabled   INTEGER NOT NULL DEFAULT 1,
    config    TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    module_id   TEXT NOT NULL,
    handler     TEXT NOT NULL,
    schedule    TEXT,
    enabled     INTEGER NOT NULL DEFAULT 1,
    timeout_ms  INTEGER NOT NULL,
    retries     INTEGER,
    config      TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_module ON jobs(module_id);

CREATE TABLE IF NOT EXISTS job_schedules (
    job_id    TEXT PRIMARY KEY,
    cron      TEXT NOT NULL,
    timezone  TEXT NOT NULL DEFAULT 'UTC',
    enabled   INTEGER NOT NULL DEFAULT 1,
    last_run  TEXT,
    next_run  TEXT
);

CREATE TABLE IF NOT EXISTS job_executions (
    id            TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL,
    dispatch_id   TEXT,
    status        TEXT NOT NULL,
    trigger_kind  TEXT NOT NULL,
    attempt       INTEGER NOT NULL DEFAULT 1,
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    result        TEXT,
    error         TEXT,
    duration_ms   INTEGER,
    logs          TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_executions_job ON job_executions(job_id, started_at);
CREATE INDEX IF NOT EXISTS idx_executions_status ON job_executions(status);

CREATE TABLE IF NOT EXISTS queue_entries (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    payload       TEXT NOT NULL,
    trigger_kind  TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    state         TEXT NOT NULL,
    run_at        INTEGER NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL DEFAULT 1,
    last_error    TEXT,
    created_at    INTEGER NOT NULL,
    finished_at   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_entries(state, run_at);

CREATE TABLE IF NOT EXISTS recurring_entries (
    job_id       TEXT PRIMARY KEY,
    cron         TEXT NOT NULL,
    timezone     TEXT NOT NULL,
    next_run_at  INTEGER NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        info!(path = %path.as_ref().display(), "Job store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Wrap a shared store as the full set of engine store roles.
    pub fn into_stores(self: Arc<Self>) -> Stores {
        Stores::from_backend(self)
    }
}

pub(crate) fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn to_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_text(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("bad epoch millis {ms}")))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("bad {what} json: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}
