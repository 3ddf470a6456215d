//! Agent registry: durable per-agent state.
//!
//! This is the single source of truth for agent liveness. Other
//! components keep only agent ids and re-fetch before acting.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::agent::{AgentRecord, CompletionReason, RuntimeKind};
use crate::models::health::HealthState;
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for agent records.
#[derive(Clone)]
pub struct AgentRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    runtime_kind: String,
    session_handle: String,
    workspace: String,
    health: String,
    last_heartbeat: String,
    context_tokens: i64,
    linked_work_item: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    completion_reason: Option<String>,
    output_digest: Option<String>,
}

impl AgentRow {
    fn into_record(self) -> Result<AgentRecord> {
        let runtime_kind = RuntimeKind::parse(&self.runtime_kind)
            .ok_or_else(|| AppError::Db(format!("invalid runtime_kind: {}", self.runtime_kind)))?;
        let health = HealthState::parse(&self.health)
            .ok_or_else(|| AppError::Db(format!("invalid health: {}", self.health)))?;
        let completion_reason = self
            .completion_reason
            .as_deref()
            .map(|raw| {
                CompletionReason::parse(raw)
                    .ok_or_else(|| AppError::Db(format!("invalid completion_reason: {raw}")))
            })
            .transpose()?;

        Ok(AgentRecord {
            id: self.id,
            runtime_kind,
            session_handle: self.session_handle,
            workspace: self.workspace,
            health,
            last_heartbeat: parse_ts(&self.last_heartbeat, "last_heartbeat")?,
            context_tokens: u64::try_from(self.context_tokens).unwrap_or(0),
            linked_work_item: self.linked_work_item,
            started_at: parse_ts(&self.started_at, "started_at")?,
            completed_at: parse_opt_ts(self.completed_at.as_deref(), "completed_at")?,
            completion_reason,
            output_digest: self.output_digest,
        })
    }
}

fn tokens_to_db(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

impl AgentRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new agent record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including duplicate ids).
    pub async fn create(&self, record: &AgentRecord) -> Result<AgentRecord> {
        sqlx::query(
            "INSERT INTO agent (id, runtime_kind, session_handle, workspace, health,
             last_heartbeat, context_tokens, linked_work_item, started_at, completed_at,
             completion_reason, output_digest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&record.id)
        .bind(record.runtime_kind.as_str())
        .bind(&record.session_handle)
        .bind(&record.workspace)
        .bind(record.health.as_str())
        .bind(format_ts(record.last_heartbeat))
        .bind(tokens_to_db(record.context_tokens))
        .bind(&record.linked_work_item)
        .bind(format_ts(record.started_at))
        .bind(record.completed_at.map(format_ts))
        .bind(record.completion_reason.map(CompletionReason::as_str))
        .bind(&record.output_digest)
        .execute(self.db.as_ref())
        .await?;

        Ok(record.clone())
    }

    /// Retrieve an agent by identifier.
    ///
    /// Returns `Ok(None)` if the agent does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<AgentRecord>> {
        let row: Option<AgentRow> = sqlx::query_as("SELECT * FROM agent WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(AgentRow::into_record).transpose()
    }

    /// Retrieve an agent by identifier, failing if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist.
    pub async fn require(&self, id: &str) -> Result<AgentRecord> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("agent {id} not found")))
    }

    /// List agents that have not reached a terminal state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_live(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT * FROM agent WHERE completed_at IS NULL ORDER BY started_at ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(AgentRow::into_record).collect()
    }

    /// List every agent, most recently started first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as("SELECT * FROM agent ORDER BY started_at DESC")
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(AgentRow::into_record).collect()
    }

    /// Record a heartbeat for a live agent, optionally updating its
    /// context size.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist, or
    /// `AppError::Validation` if it is already terminal.
    pub async fn record_heartbeat(
        &self,
        id: &str,
        at: DateTime<Utc>,
        context_tokens: Option<u64>,
    ) -> Result<AgentRecord> {
        let current = self.require(id).await?;
        if current.is_terminal() {
            return Err(AppError::Validation(format!("agent {id} is no longer running")));
        }

        let tokens = context_tokens.unwrap_or(current.context_tokens);
        sqlx::query(
            "UPDATE agent SET last_heartbeat = ?1, context_tokens = ?2
             WHERE id = ?3 AND completed_at IS NULL",
        )
        .bind(format_ts(at))
        .bind(tokens_to_db(tokens))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        self.require(id).await
    }

    /// Persist the latest health classification of a live agent.
    ///
    /// Terminal records are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_health(&self, id: &str, health: HealthState) -> Result<()> {
        sqlx::query("UPDATE agent SET health = ?1 WHERE id = ?2 AND completed_at IS NULL")
            .bind(health.as_str())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Store a new output fingerprint, optionally moving the heartbeat
    /// forward when the fingerprint reflects genuine agent activity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_output_digest(
        &self,
        id: &str,
        digest: &str,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(at) = heartbeat {
            sqlx::query(
                "UPDATE agent SET output_digest = ?1, last_heartbeat = ?2
                 WHERE id = ?3 AND completed_at IS NULL",
            )
            .bind(digest)
            .bind(format_ts(at))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        } else {
            sqlx::query(
                "UPDATE agent SET output_digest = ?1 WHERE id = ?2 AND completed_at IS NULL",
            )
            .bind(digest)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        }
        Ok(())
    }

    /// Mark a live agent terminal.
    ///
    /// Returns `true` if this call performed the transition and `false`
    /// if the record was already terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent does not exist.
    pub async fn mark_terminal(&self, id: &str, reason: CompletionReason) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent SET completed_at = ?1, completion_reason = ?2
             WHERE id = ?3 AND completed_at IS NULL",
        )
        .bind(format_ts(Utc::now()))
        .bind(reason.as_str())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "unknown" from "already terminal".
            self.require(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Delete terminal agents that completed before `before`.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM agent WHERE completed_at IS NOT NULL AND completed_at < ?1")
                .bind(format_ts(before))
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }
}
