//! Specialist roles, queue items, and the requeue circuit breaker.

use std::cmp::Reverse;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Automatic requeues allowed per work item before a human must step in.
pub const REQUEUE_CEILING: u32 = 3;

/// Fixed-role agents that consume a dedicated queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialistType {
    /// Merges approved changes.
    MergeAgent,
    /// Reviews changes.
    ReviewAgent,
    /// Runs and fixes tests.
    TestAgent,
}

impl SpecialistType {
    /// Every specialist, in display order.
    pub const ALL: [Self; 3] = [Self::MergeAgent, Self::ReviewAgent, Self::TestAgent];

    /// Storage / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MergeAgent => "merge-agent",
            Self::ReviewAgent => "review-agent",
            Self::TestAgent => "test-agent",
        }
    }

    /// Multiplexer session name used for this specialist.
    #[must_use]
    pub fn session_name(self) -> String {
        format!("cloister-{}", self.as_str())
    }
}

impl Display for SpecialistType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecialistType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge-agent" | "merge" => Ok(Self::MergeAgent),
            "review-agent" | "review" => Ok(Self::ReviewAgent),
            "test-agent" | "test" => Ok(Self::TestAgent),
            other => Err(AppError::Validation(format!(
                "unknown specialist '{other}' (expected merge-agent, review-agent or test-agent)"
            ))),
        }
    }
}

/// Queue priority; declaration order is ascending urgency.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Whenever the specialist is idle.
    Low,
    /// Regular work.
    #[default]
    Normal,
    /// Ahead of regular work.
    High,
    /// Ahead of everything.
    Urgent,
}

impl Priority {
    /// Storage / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(AppError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Opaque work description carried by a queue item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueuePayload {
    /// Issue identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    /// Pull request URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// Workspace path the specialist should operate in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Branch under work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Number of changed files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    /// Free-form instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueuePayload {
    /// Render the payload as a task message for the specialist.
    #[must_use]
    pub fn to_task_message(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref issue) = self.issue_id {
            parts.push(format!("Issue: {issue}"));
        }
        if let Some(ref pr) = self.pr_url {
            parts.push(format!("PR: {pr}"));
        }
        if let Some(ref ws) = self.workspace {
            parts.push(format!("Workspace: {ws}"));
        }
        if let Some(ref branch) = self.branch {
            parts.push(format!("Branch: {branch}"));
        }
        if let Some(files) = self.files_changed {
            parts.push(format!("Files changed: {files}"));
        }
        if let Some(ref message) = self.message {
            parts.push(message.clone());
        }
        parts.join("\n")
    }
}

/// A unit of pending specialist work; immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpecialistQueueItem {
    /// Unique identifier.
    pub id: String,
    /// Owning specialist queue.
    pub specialist_type: SpecialistType,
    /// Dequeue priority.
    pub priority: Priority,
    /// Free-form origin tag.
    pub source: String,
    /// Work description.
    pub payload: QueuePayload,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SpecialistQueueItem {
    /// Construct a new item stamped with the current time.
    #[must_use]
    pub fn new(
        specialist_type: SpecialistType,
        priority: Priority,
        source: impl Into<String>,
        payload: QueuePayload,
    ) -> Self {
        Self {
            id: format!("q-{}", Uuid::new_v4()),
            specialist_type,
            priority,
            source: source.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Sort items into dequeue order: priority descending, then oldest first.
///
/// The sort is stable, so items with equal priority and timestamp keep
/// their insertion order.
pub fn sort_for_dequeue(items: &mut [SpecialistQueueItem]) {
    items.sort_by_key(|item| (Reverse(item.priority), item.created_at));
}

/// Read-only view of a specialist queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueSnapshot {
    /// Specialist whose queue this is.
    pub specialist_type: SpecialistType,
    /// Pending items in dequeue order.
    pub items: Vec<SpecialistQueueItem>,
    /// Whether anything is pending.
    pub has_work: bool,
    /// Number of `urgent` items.
    pub urgent_count: usize,
}

impl QueueSnapshot {
    /// Build a snapshot from items already in dequeue order.
    #[must_use]
    pub fn from_items(specialist_type: SpecialistType, items: Vec<SpecialistQueueItem>) -> Self {
        let urgent_count = items
            .iter()
            .filter(|item| item.priority == Priority::Urgent)
            .count();
        Self {
            specialist_type,
            has_work: !items.is_empty(),
            urgent_count,
            items,
        }
    }
}

/// Per-work-item automatic requeue counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RequeueCounter {
    /// Work item identifier.
    pub work_item_id: String,
    /// Automatic requeues requested so far.
    pub auto_requeue_count: u32,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl RequeueCounter {
    /// Whether further automatic requeues are rejected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.auto_requeue_count > REQUEUE_CEILING
    }

    /// Requeues still allowed before the circuit opens.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        REQUEUE_CEILING.saturating_sub(self.auto_requeue_count)
    }
}

/// Outcome of an accepted requeue request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RequeueReceipt {
    /// Item that was enqueued.
    pub item: SpecialistQueueItem,
    /// Counter value after this request.
    pub auto_requeue_count: u32,
    /// Requeues still allowed.
    pub remaining_requeues: u32,
}

/// Persisted per-specialist runtime state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpecialistState {
    /// Specialist.
    pub specialist_type: SpecialistType,
    /// Resumable runtime session identifier.
    pub saved_session_id: Option<String>,
    /// Most recent wake.
    pub last_wake_at: Option<DateTime<Utc>>,
    /// Number of wakes recorded.
    pub wake_count: u32,
    /// Agent record of the most recent spawned session.
    pub current_agent_id: Option<String>,
}

impl SpecialistState {
    /// State for a specialist that has never been woken.
    #[must_use]
    pub fn empty(specialist_type: SpecialistType) -> Self {
        Self {
            specialist_type,
            saved_session_id: None,
            last_wake_at: None,
            wake_count: 0,
            current_agent_id: None,
        }
    }
}
