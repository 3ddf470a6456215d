//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod agent_repo;
pub mod convoy_repo;
pub mod db;
pub mod queue_repo;
pub mod retention;
pub mod schema;
pub mod specialist_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Format a timestamp so that lexical order matches chronological order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column.
pub(crate) fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Parse an optional stored timestamp column.
pub(crate) fn parse_opt_ts(raw: Option<&str>, column: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(s, column)).transpose()
}
