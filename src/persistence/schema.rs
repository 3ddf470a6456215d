//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so it is safe to
//! re-run on every supervisor startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS agent (
    id                TEXT PRIMARY KEY NOT NULL,
    runtime_kind      TEXT NOT NULL CHECK(runtime_kind IN ('native-anthropic','routed','other')),
    session_handle    TEXT NOT NULL,
    workspace         TEXT NOT NULL,
    health            TEXT NOT NULL CHECK(health IN ('active','stale','warning','stuck')),
    last_heartbeat    TEXT NOT NULL,
    context_tokens    INTEGER NOT NULL DEFAULT 0,
    linked_work_item  TEXT,
    started_at        TEXT NOT NULL,
    completed_at      TEXT,
    completion_reason TEXT,
    output_digest     TEXT
);

CREATE TABLE IF NOT EXISTS specialist_queue (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    specialist_type TEXT NOT NULL CHECK(specialist_type IN ('merge-agent','review-agent','test-agent')),
    priority        TEXT NOT NULL CHECK(priority IN ('low','normal','high','urgent')),
    source          TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requeue_counter (
    work_item_id       TEXT PRIMARY KEY NOT NULL,
    auto_requeue_count INTEGER NOT NULL DEFAULT 0,
    updated_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS specialist_state (
    specialist_type  TEXT PRIMARY KEY NOT NULL,
    saved_session_id TEXT,
    last_wake_at     TEXT,
    wake_count       INTEGER NOT NULL DEFAULT 0,
    current_agent_id TEXT
);

CREATE TABLE IF NOT EXISTS convoy (
    id           TEXT PRIMARY KEY NOT NULL,
    template     TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    output_dir   TEXT NOT NULL,
    params       TEXT NOT NULL,
    agents       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_live ON agent(completed_at);
CREATE INDEX IF NOT EXISTS idx_queue_specialist ON specialist_queue(specialist_type);
CREATE INDEX IF NOT EXISTS idx_convoy_started ON convoy(started_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
