//! Specialist work queues, the requeue circuit breaker, and wake.
//!
//! Each specialist (merge, review, test) owns a durable priority queue
//! and a single long-lived session. `wake` is serialized per specialist
//! so two requests arriving together never spawn two sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::config::CloisterConfig;
use crate::models::agent::{AgentRecord, CompletionReason};
use crate::models::specialist::{
    Priority, QueuePayload, QueueSnapshot, RequeueReceipt, SpecialistQueueItem, SpecialistState,
    SpecialistType,
};
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::queue_repo::QueueRepo;
use crate::persistence::specialist_repo::SpecialistRepo;
use crate::process::ProcessControl;
use crate::{AppError, Result};

use super::spawner::{launch_command, AgentSpawner, SpawnRequest};

/// Source tag for work queued through a re-review request.
pub const REVIEW_REQUEST_SOURCE: &str = "request-review";

/// What a wake did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WakeOutcome {
    /// Specialist woken.
    pub specialist_type: SpecialistType,
    /// Session the specialist runs in.
    pub session_name: String,
    /// Agent record of the running session, when known.
    pub agent_id: Option<String>,
    /// Whether a new session was started.
    pub spawned: bool,
    /// Whether the new session resumed a saved runtime session.
    pub resumed: bool,
    /// Whether a message was delivered to an already running session.
    pub message_sent: bool,
}

/// Result of handing the next queued item to a specialist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DispatchOutcome {
    /// Item that was dispatched.
    pub item: SpecialistQueueItem,
    /// Wake performed for it.
    pub wake: WakeOutcome,
}

/// One row of `specialists list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpecialistSummary {
    /// Specialist.
    pub specialist_type: SpecialistType,
    /// Session name.
    pub session_name: String,
    /// Whether the session is alive.
    pub running: bool,
    /// Pending items.
    pub queue_depth: u64,
    /// Pending `urgent` items.
    pub urgent_count: usize,
    /// Most recent wake.
    pub last_wake_at: Option<DateTime<Utc>>,
    /// Wakes recorded.
    pub wake_count: u32,
    /// Resumable runtime session id.
    pub saved_session_id: Option<String>,
    /// Agent record of the latest session.
    pub current_agent_id: Option<String>,
}

/// Queue, circuit breaker, and session management for specialists.
pub struct SpecialistQueue {
    config: Arc<CloisterConfig>,
    queue: QueueRepo,
    state: SpecialistRepo,
    agents: AgentRepo,
    spawner: AgentSpawner,
    process: Arc<dyn ProcessControl>,
    wake_locks: HashMap<SpecialistType, Mutex<()>>,
}

impl SpecialistQueue {
    /// Service over the given stores and process seam.
    #[must_use]
    pub fn new(
        config: Arc<CloisterConfig>,
        queue: QueueRepo,
        state: SpecialistRepo,
        agents: AgentRepo,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        let spawner = AgentSpawner::new(Arc::clone(&process), agents.clone());
        let wake_locks = SpecialistType::ALL
            .iter()
            .map(|s| (*s, Mutex::new(())))
            .collect();
        Self {
            config,
            queue,
            state,
            agents,
            spawner,
            process,
            wake_locks,
        }
    }

    /// Add work to a specialist's queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the item cannot be stored.
    pub async fn enqueue(
        &self,
        specialist: SpecialistType,
        priority: Priority,
        source: &str,
        payload: QueuePayload,
    ) -> Result<SpecialistQueueItem> {
        let item = SpecialistQueueItem::new(specialist, priority, source, payload);
        let item = self.queue.enqueue(&item).await?;
        info!(
            specialist = specialist.as_str(),
            item_id = %item.id,
            priority = item.priority.as_str(),
            "work queued"
        );
        Ok(item)
    }

    /// Pending items in dequeue order; does not consume anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the queue cannot be read.
    pub async fn peek_queue(&self, specialist: SpecialistType) -> Result<QueueSnapshot> {
        let items = self.queue.list_pending(specialist).await?;
        Ok(QueueSnapshot::from_items(specialist, items))
    }

    /// Remove and return the next item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the queue cannot be updated.
    pub async fn dequeue(&self, specialist: SpecialistType) -> Result<Option<SpecialistQueueItem>> {
        self.queue.dequeue(specialist).await
    }

    /// Requeue work for `work_item_id`, subject to the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CircuitBreaker` once the work item has used up
    /// its automatic requeues; nothing is enqueued in that case.
    pub async fn request_requeue(
        &self,
        work_item_id: &str,
        specialist: SpecialistType,
        priority: Priority,
        source: &str,
        payload: QueuePayload,
    ) -> Result<RequeueReceipt> {
        let item = SpecialistQueueItem::new(specialist, priority, source, payload);
        match self.queue.request_requeue(work_item_id, &item).await {
            Ok(receipt) => {
                info!(
                    work_item_id,
                    specialist = specialist.as_str(),
                    count = receipt.auto_requeue_count,
                    remaining = receipt.remaining_requeues,
                    "work requeued"
                );
                Ok(receipt)
            }
            Err(err @ AppError::CircuitBreaker { .. }) => {
                warn!(work_item_id, %err, "requeue circuit open");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Queue a re-review of `issue_id` for the review specialist.
    ///
    /// # Errors
    ///
    /// Same as [`request_requeue`](Self::request_requeue).
    pub async fn request_review(
        &self,
        issue_id: &str,
        message: Option<String>,
    ) -> Result<RequeueReceipt> {
        let payload = QueuePayload {
            issue_id: Some(issue_id.to_owned()),
            message,
            ..QueuePayload::default()
        };
        self.request_requeue(
            issue_id,
            SpecialistType::ReviewAgent,
            Priority::Normal,
            REVIEW_REQUEST_SOURCE,
            payload,
        )
        .await
    }

    /// Human reset of a work item's requeue counter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the work item has no counter.
    pub async fn reset_requeue(&self, work_item_id: &str) -> Result<()> {
        self.queue.reset_counter(work_item_id).await?;
        info!(work_item_id, "requeue counter reset");
        Ok(())
    }

    /// Make sure the specialist's session is running.
    ///
    /// A live session only receives `message` (if any). Otherwise a new
    /// session is started, resuming the saved runtime session when one
    /// is recorded, and `message` becomes its initial prompt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalTool` if the session cannot be probed,
    /// messaged or started.
    pub async fn wake(
        &self,
        specialist: SpecialistType,
        message: Option<&str>,
    ) -> Result<WakeOutcome> {
        let span = info_span!("specialist_wake", specialist = specialist.as_str());
        async move {
            let lock = self
                .wake_locks
                .get(&specialist)
                .ok_or_else(|| AppError::NotFound(format!("no wake lock for {specialist}")))?;
            let _serialized = lock.lock().await;

            let session_name = specialist.session_name();
            let state = self.state.get_state(specialist).await?;

            if self.process.exists(&session_name).await? {
                let mut message_sent = false;
                if let Some(message) = message {
                    self.process.send_input(&session_name, message).await?;
                    message_sent = true;
                }
                info!(message_sent, "specialist already running");
                return Ok(WakeOutcome {
                    specialist_type: specialist,
                    session_name,
                    agent_id: state.current_agent_id,
                    spawned: false,
                    resumed: false,
                    message_sent,
                });
            }

            self.retire_previous(&state).await;
            self.spawn_session(specialist, &state, message).await
        }
        .instrument(span)
        .await
    }

    /// Close the registry record of a session that has gone away.
    async fn retire_previous(&self, state: &SpecialistState) {
        let Some(ref previous) = state.current_agent_id else {
            return;
        };
        if let Err(err) = self
            .agents
            .mark_terminal(previous, CompletionReason::SessionGone)
            .await
        {
            warn!(agent_id = %previous, %err, "could not retire previous specialist agent");
        }
    }

    async fn spawn_session(
        &self,
        specialist: SpecialistType,
        state: &SpecialistState,
        message: Option<&str>,
    ) -> Result<WakeOutcome> {
        let launch = &self.config.specialists;
        let mut args = launch.host_cli_args.clone();
        let resumed = if let Some(ref saved) = state.saved_session_id {
            args.push(launch.resume_flag.clone());
            args.push(saved.clone());
            true
        } else {
            false
        };

        let agent_id = AgentRecord::generate_id(specialist.as_str());
        let session_name = specialist.session_name();
        let request = SpawnRequest {
            command: Some(launch_command(
                &agent_id,
                self.config.http_port,
                &launch.host_cli,
                &args,
                message,
            )),
            agent_id,
            session_name: session_name.clone(),
            workspace: self.config.specialist_workspace(),
            runtime_kind: self.config.agents.runtime_kind,
            linked_work_item: None,
        };

        let agent = self.spawner.spawn(request).await?;
        self.state
            .record_wake(specialist, &agent.id, agent.started_at)
            .await?;
        info!(agent_id = %agent.id, resumed, "specialist woken");

        Ok(WakeOutcome {
            specialist_type: specialist,
            session_name,
            agent_id: Some(agent.id),
            spawned: true,
            resumed,
            message_sent: false,
        })
    }

    /// Hand the next queued item to the specialist.
    ///
    /// Returns `Ok(None)` when the queue is empty. If the wake fails the
    /// item is put back.
    ///
    /// # Errors
    ///
    /// Returns the wake error after the item has been restored.
    pub async fn dispatch_next(&self, specialist: SpecialistType) -> Result<Option<DispatchOutcome>> {
        let Some(item) = self.queue.dequeue(specialist).await? else {
            return Ok(None);
        };
        let task = item.payload.to_task_message();
        match self.wake(specialist, Some(&task)).await {
            Ok(wake) => {
                info!(item_id = %item.id, specialist = specialist.as_str(), "work dispatched");
                Ok(Some(DispatchOutcome { item, wake }))
            }
            Err(err) => {
                warn!(item_id = %item.id, %err, "dispatch failed; restoring item");
                self.queue.enqueue(&item).await?;
                Err(err)
            }
        }
    }

    /// Remember the runtime session id so the next wake resumes it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty id.
    pub async fn record_session_id(
        &self,
        specialist: SpecialistType,
        session_id: &str,
    ) -> Result<SpecialistState> {
        let state = self.state.record_session_id(specialist, session_id).await?;
        info!(specialist = specialist.as_str(), session_id, "specialist session id saved");
        Ok(state)
    }

    /// Overview of every specialist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalTool` if a session cannot be probed,
    /// or `AppError::Db` if state cannot be read.
    pub async fn list_specialists(&self) -> Result<Vec<SpecialistSummary>> {
        let mut summaries = Vec::with_capacity(SpecialistType::ALL.len());
        for specialist in SpecialistType::ALL {
            let session_name = specialist.session_name();
            let running = self.process.exists(&session_name).await?;
            let snapshot = self.peek_queue(specialist).await?;
            let state = self.state.get_state(specialist).await?;
            summaries.push(SpecialistSummary {
                specialist_type: specialist,
                session_name,
                running,
                queue_depth: u64::try_from(snapshot.items.len()).unwrap_or(u64::MAX),
                urgent_count: snapshot.urgent_count,
                last_wake_at: state.last_wake_at,
                wake_count: state.wake_count,
                saved_session_id: state.saved_session_id,
                current_agent_id: state.current_agent_id,
            });
        }
        Ok(summaries)
    }
}
