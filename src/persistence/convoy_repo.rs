//! Convoy persistence.
//!
//! The aggregate status is never stored; it is recomputed from the
//! member list every time a convoy is loaded.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::convoy::{Convoy, ConvoyStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_opt_ts, parse_ts};

/// Repository for [`Convoy`] records.
#[derive(Clone)]
pub struct ConvoyRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ConvoyRow {
    id: String,
    template: String,
    started_at: String,
    completed_at: Option<String>,
    output_dir: String,
    params: String,
    agents: String,
}

impl ConvoyRow {
    fn into_convoy(self) -> Result<Convoy> {
        let params = serde_json::from_str(&self.params)
            .map_err(|e| AppError::Db(format!("invalid convoy params: {e}")))?;
        let agents = serde_json::from_str(&self.agents)
            .map_err(|e| AppError::Db(format!("invalid convoy agents: {e}")))?;

        let mut convoy = Convoy {
            id: self.id,
            template: self.template,
            status: ConvoyStatus::Running,
            started_at: parse_ts(&self.started_at, "started_at")?,
            completed_at: parse_opt_ts(self.completed_at.as_deref(), "completed_at")?,
            output_dir: self.output_dir,
            params,
            agents,
        };
        convoy.recompute_status();
        Ok(convoy)
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AppError::Db(format!("serialize {what}: {e}")))
}

impl ConvoyRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new convoy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, convoy: &Convoy) -> Result<Convoy> {
        sqlx::query(
            "INSERT INTO convoy (id, template, started_at, completed_at, output_dir, params, agents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&convoy.id)
        .bind(&convoy.template)
        .bind(format_ts(convoy.started_at))
        .bind(convoy.completed_at.map(format_ts))
        .bind(&convoy.output_dir)
        .bind(to_json(&convoy.params, "params")?)
        .bind(to_json(&convoy.agents, "agents")?)
        .execute(self.db.as_ref())
        .await?;
        Ok(convoy.clone())
    }

    /// Load a convoy by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Convoy>> {
        let row: Option<ConvoyRow> = sqlx::query_as("SELECT * FROM convoy WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(ConvoyRow::into_convoy).transpose()
    }

    /// Persist the member list and completion stamp of an existing convoy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the convoy does not exist.
    pub async fn update(&self, convoy: &Convoy) -> Result<()> {
        let result =
            sqlx::query("UPDATE convoy SET agents = ?1, completed_at = ?2 WHERE id = ?3")
                .bind(to_json(&convoy.agents, "agents")?)
                .bind(convoy.completed_at.map(format_ts))
                .bind(&convoy.id)
                .execute(self.db.as_ref())
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("convoy {} not found", convoy.id)));
        }
        Ok(())
    }

    /// Every convoy, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Convoy>> {
        let rows: Vec<ConvoyRow> = sqlx::query_as("SELECT * FROM convoy ORDER BY started_at DESC")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(ConvoyRow::into_convoy).collect()
    }

    /// Delete convoys that finished before `before`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM convoy WHERE completed_at IS NOT NULL AND completed_at < ?1",
        )
        .bind(format_ts(before))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
