//! Specialist queue and requeue counter repository.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::models::specialist::{
    sort_for_dequeue, Priority, RequeueCounter, RequeueReceipt, SpecialistQueueItem,
    SpecialistType, REQUEUE_CEILING,
};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_ts, parse_ts};

/// Repository for specialist queue items and requeue counters.
#[derive(Clone)]
pub struct QueueRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    specialist_type: String,
    priority: String,
    source: String,
    payload: String,
    created_at: String,
}

impl QueueRow {
    fn into_item(self) -> Result<SpecialistQueueItem> {
        let specialist_type = SpecialistType::from_str(&self.specialist_type)
            .map_err(|e| AppError::Db(format!("invalid specialist_type: {e}")))?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|e| AppError::Db(format!("invalid priority: {e}")))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Db(format!("invalid payload: {e}")))?;

        Ok(SpecialistQueueItem {
            id: self.id,
            specialist_type,
            priority,
            source: self.source,
            payload,
            created_at: parse_ts(&self.created_at, "created_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    work_item_id: String,
    auto_requeue_count: i64,
    updated_at: String,
}

impl CounterRow {
    fn into_counter(self) -> Result<RequeueCounter> {
        Ok(RequeueCounter {
            work_item_id: self.work_item_id,
            auto_requeue_count: count_from_db(self.auto_requeue_count),
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
        })
    }
}

fn count_from_db(raw: i64) -> u32 {
    u32::try_from(raw).unwrap_or(u32::MAX)
}

async fn insert_item(conn: &mut SqliteConnection, item: &SpecialistQueueItem) -> Result<()> {
    let payload = serde_json::to_string(&item.payload)
        .map_err(|e| AppError::Db(format!("serialize payload: {e}")))?;

    sqlx::query(
        "INSERT INTO specialist_queue (id, specialist_type, priority, source, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&item.id)
    .bind(item.specialist_type.as_str())
    .bind(item.priority.as_str())
    .bind(&item.source)
    .bind(&payload)
    .bind(format_ts(item.created_at))
    .execute(conn)
    .await?;
    Ok(())
}

async fn pending_in(
    conn: &mut SqliteConnection,
    specialist: SpecialistType,
) -> Result<Vec<SpecialistQueueItem>> {
    let rows: Vec<QueueRow> = sqlx::query_as(
        "SELECT id, specialist_type, priority, source, payload, created_at
         FROM specialist_queue WHERE specialist_type = ?1 ORDER BY seq ASC",
    )
    .bind(specialist.as_str())
    .fetch_all(conn)
    .await?;

    let mut items = rows
        .into_iter()
        .map(QueueRow::into_item)
        .collect::<Result<Vec<_>>>()?;
    sort_for_dequeue(&mut items);
    Ok(items)
}

impl QueueRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an item to its specialist's queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn enqueue(&self, item: &SpecialistQueueItem) -> Result<SpecialistQueueItem> {
        let mut conn = self.db.acquire().await?;
        insert_item(&mut conn, item).await?;
        Ok(item.clone())
    }

    /// All pending items for a specialist, in dequeue order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_pending(&self, specialist: SpecialistType) -> Result<Vec<SpecialistQueueItem>> {
        let mut conn = self.db.acquire().await?;
        pending_in(&mut conn, specialist).await
    }

    /// Remove and return the next item for a specialist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn dequeue(&self, specialist: SpecialistType) -> Result<Option<SpecialistQueueItem>> {
        let mut tx = self.db.begin().await?;
        let head = pending_in(&mut tx, specialist).await?.into_iter().next();
        if let Some(ref item) = head {
            sqlx::query("DELETE FROM specialist_queue WHERE id = ?1")
                .bind(&item.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(head)
    }

    /// Increment the requeue counter for `work_item_id` and, while the
    /// circuit is closed, enqueue `item` in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CircuitBreaker` once the counter exceeds
    /// [`REQUEUE_CEILING`]; nothing is enqueued in that case.
    pub async fn request_requeue(
        &self,
        work_item_id: &str,
        item: &SpecialistQueueItem,
    ) -> Result<RequeueReceipt> {
        let mut tx = self.db.begin().await?;

        let (raw_count,): (i64,) = sqlx::query_as(
            "INSERT INTO requeue_counter (work_item_id, auto_requeue_count, updated_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(work_item_id) DO UPDATE
             SET auto_requeue_count = auto_requeue_count + 1, updated_at = excluded.updated_at
             RETURNING auto_requeue_count",
        )
        .bind(work_item_id)
        .bind(format_ts(Utc::now()))
        .fetch_one(&mut *tx)
        .await?;
        let count = count_from_db(raw_count);

        if count > REQUEUE_CEILING {
            tx.commit().await?;
            return Err(AppError::CircuitBreaker {
                work_item_id: work_item_id.to_owned(),
                auto_requeue_count: count,
            });
        }

        insert_item(&mut tx, item).await?;
        tx.commit().await?;

        Ok(RequeueReceipt {
            item: item.clone(),
            auto_requeue_count: count,
            remaining_requeues: REQUEUE_CEILING - count,
        })
    }

    /// Current requeue counter for a work item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_counter(&self, work_item_id: &str) -> Result<Option<RequeueCounter>> {
        let row: Option<CounterRow> =
            sqlx::query_as("SELECT * FROM requeue_counter WHERE work_item_id = ?1")
                .bind(work_item_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(CounterRow::into_counter).transpose()
    }

    /// Human reset of a work item's requeue counter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the work item has no counter.
    pub async fn reset_counter(&self, work_item_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM requeue_counter WHERE work_item_id = ?1")
            .bind(work_item_id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "no requeue counter for work item {work_item_id}"
            )));
        }
        Ok(())
    }
}
