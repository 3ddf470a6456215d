//! `SQLite` connection setup and schema bootstrap.
//!
//! Every store uses a single-connection pool, so writes are serialized
//! by the pool itself and readers never observe a half-applied change.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// Open (creating if needed) the on-disk database and apply the schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the directory cannot be created, the
/// connection fails, or the schema cannot be applied.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Open a private in-memory database with the schema applied.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect_memory() -> Result<Database> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
