//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting terminal agent records and
//! finished convoys older than `retention_days`. Live agents and
//! running convoys are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::agent_repo::AgentRepo;
use super::convoy_repo::ConvoyRepo;
use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Terminal agent records deleted.
    pub agents: u64,
    /// Finished convoys deleted.
    pub convoys: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly; the first pass happens immediately.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run a single purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if either delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<PurgeReport> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let agents = AgentRepo::new(Arc::clone(db)).purge_terminal(cutoff).await?;
    let convoys = ConvoyRepo::new(Arc::clone(db))
        .purge_completed(cutoff)
        .await?;

    info!(retention_days, agents, convoys, "retention purge completed");
    Ok(PurgeReport { agents, convoys })
}
