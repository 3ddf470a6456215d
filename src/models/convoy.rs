//! Convoy model and status aggregation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Lifecycle of one convoy member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Not yet started.
    Pending,
    /// Agent session running.
    Running,
    /// Agent finished successfully.
    Completed,
    /// Agent failed, was killed, or never started.
    Failed,
}

impl MemberStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a member transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

/// Aggregate convoy status, derived from member statuses on every read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvoyStatus {
    /// At least one member pending or running.
    Running,
    /// Every member completed.
    Completed,
    /// Every member failed.
    Failed,
    /// All members terminal with a mix of outcomes.
    Partial,
}

impl ConvoyStatus {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    /// Whether the convoy can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for ConvoyStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            other => Err(AppError::Validation(format!(
                "unknown convoy status '{other}'"
            ))),
        }
    }
}

/// Aggregate member statuses into a convoy status.
///
/// An empty member list is treated as `completed`.
#[must_use]
pub fn aggregate_status(members: &[MemberStatus]) -> ConvoyStatus {
    if members
        .iter()
        .any(|s| matches!(s, MemberStatus::Pending | MemberStatus::Running))
    {
        return ConvoyStatus::Running;
    }
    let completed = members
        .iter()
        .filter(|s| **s == MemberStatus::Completed)
        .count();
    if completed == members.len() {
        ConvoyStatus::Completed
    } else if completed == 0 {
        ConvoyStatus::Failed
    } else {
        ConvoyStatus::Partial
    }
}

/// One member of a convoy, weakly referencing its agent record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyAgentRef {
    /// Role name within the template.
    pub role: String,
    /// Sub-agent definition the role runs as.
    pub subagent_kind: String,
    /// Agent record id once spawned.
    pub agent_id: Option<String>,
    /// Member lifecycle status.
    pub status: MemberStatus,
    /// File the member is asked to write its result to.
    pub output_file: Option<String>,
    /// When the agent started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the member reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConvoyAgentRef {
    /// A member that has not started yet.
    #[must_use]
    pub fn pending(role: String, subagent_kind: String, output_file: Option<String>) -> Self {
        Self {
            role,
            subagent_kind,
            agent_id: None,
            status: MemberStatus::Pending,
            output_file,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Apply a transition if the member state machine allows it.
    ///
    /// Returns `false` (and leaves the member untouched) otherwise.
    pub fn transition(&mut self, next: MemberStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        if next == MemberStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }
}

/// Caller-supplied parameters for a convoy start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyParams {
    /// Files under review.
    #[serde(default)]
    pub files: Vec<String>,
    /// Pull request URL.
    #[serde(default)]
    pub pr_url: Option<String>,
    /// Issue identifier.
    #[serde(default)]
    pub issue_id: Option<String>,
    /// Project directory the agents work in.
    #[serde(default)]
    pub project_path: Option<String>,
}

/// A named group of cooperating agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Convoy {
    /// Unique identifier.
    pub id: String,
    /// Template the convoy was created from.
    pub template: String,
    /// Aggregate status, recomputed from `agents` whenever the record is read.
    pub status: ConvoyStatus,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// When every member became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Directory members write their output to.
    pub output_dir: String,
    /// Parameters the convoy was started with.
    pub params: ConvoyParams,
    /// Ordered members.
    pub agents: Vec<ConvoyAgentRef>,
}

impl Convoy {
    /// Construct a convoy with all members pending.
    #[must_use]
    pub fn new(
        template: String,
        output_dir: String,
        params: ConvoyParams,
        agents: Vec<ConvoyAgentRef>,
    ) -> Self {
        let mut convoy = Self {
            id: Self::generate_id(),
            template,
            status: ConvoyStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            output_dir,
            params,
            agents,
        };
        convoy.recompute_status();
        convoy
    }

    /// Generate a short convoy identifier.
    #[must_use]
    pub fn generate_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("convoy-{}", &uuid[..8])
    }

    /// Recompute the aggregate status from the members and stamp
    /// `completed_at` the first time the convoy becomes terminal.
    pub fn recompute_status(&mut self) -> ConvoyStatus {
        let statuses: Vec<MemberStatus> = self.agents.iter().map(|a| a.status).collect();
        self.status = aggregate_status(&statuses);
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.status
    }
}
