//! Per-specialist runtime state (resumable session, wake history).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::specialist::{SpecialistState, SpecialistType};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_opt_ts};

/// Repository for [`SpecialistState`] rows.
#[derive(Clone)]
pub struct SpecialistRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    specialist_type: String,
    saved_session_id: Option<String>,
    last_wake_at: Option<String>,
    wake_count: i64,
    current_agent_id: Option<String>,
}

impl StateRow {
    fn into_state(self) -> Result<SpecialistState> {
        let specialist_type = SpecialistType::from_str(&self.specialist_type)
            .map_err(|e| AppError::Db(format!("invalid specialist_type: {e}")))?;
        Ok(SpecialistState {
            specialist_type,
            saved_session_id: self.saved_session_id,
            last_wake_at: parse_opt_ts(self.last_wake_at.as_deref(), "last_wake_at")?,
            wake_count: u32::try_from(self.wake_count).unwrap_or(u32::MAX),
            current_agent_id: self.current_agent_id,
        })
    }
}

impl SpecialistRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn ensure_row(&self, specialist: SpecialistType) -> Result<()> {
        sqlx::query(
            "INSERT INTO specialist_state (specialist_type, wake_count) VALUES (?1, 0)
             ON CONFLICT(specialist_type) DO NOTHING",
        )
        .bind(specialist.as_str())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Current state of a specialist; an empty state if never woken.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_state(&self, specialist: SpecialistType) -> Result<SpecialistState> {
        let row: Option<StateRow> =
            sqlx::query_as("SELECT * FROM specialist_state WHERE specialist_type = ?1")
                .bind(specialist.as_str())
                .fetch_optional(self.db.as_ref())
                .await?;
        match row {
            Some(row) => row.into_state(),
            None => Ok(SpecialistState::empty(specialist)),
        }
    }

    /// Record a wake that spawned `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn record_wake(
        &self,
        specialist: SpecialistType,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<SpecialistState> {
        self.ensure_row(specialist).await?;
        sqlx::query(
            "UPDATE specialist_state
             SET last_wake_at = ?1, wake_count = wake_count + 1, current_agent_id = ?2
             WHERE specialist_type = ?3",
        )
        .bind(format_ts(at))
        .bind(agent_id)
        .bind(specialist.as_str())
        .execute(self.db.as_ref())
        .await?;
        self.get_state(specialist).await
    }

    /// Remember the runtime session id so the next wake can resume it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty id.
    pub async fn record_session_id(
        &self,
        specialist: SpecialistType,
        session_id: &str,
    ) -> Result<SpecialistState> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(AppError::Validation("session id must not be empty".into()));
        }
        self.ensure_row(specialist).await?;
        sqlx::query("UPDATE specialist_state SET saved_session_id = ?1 WHERE specialist_type = ?2")
            .bind(session_id)
            .bind(specialist.as_str())
            .execute(self.db.as_ref())
            .await?;
        self.get_state(specialist).await
    }
}
