//! Agent record model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::health::HealthState;

/// Which runtime an agent process is driven by.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Anthropic's own CLI talking to the first-party API.
    #[default]
    NativeAnthropic,
    /// Same CLI routed through a model proxy.
    Routed,
    /// Anything else.
    Other,
}

impl RuntimeKind {
    /// Storage / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeAnthropic => "native-anthropic",
            Self::Routed => "routed",
            Self::Other => "other",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native-anthropic" => Some(Self::NativeAnthropic),
            "routed" => Some(Self::Routed),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Why an agent record became terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    /// The agent reported that it finished its task.
    Finished,
    /// The agent reported that it failed.
    Failed,
    /// The session disappeared without a report.
    SessionGone,
    /// The health monitor killed the session after it went stuck.
    AutoKilledStuck,
    /// Killed by an operator-wide emergency stop.
    EmergencyStop,
    /// Killed because its convoy was stopped.
    StoppedByOperator,
}

impl CompletionReason {
    /// Storage / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::SessionGone => "session-gone",
            Self::AutoKilledStuck => "auto-killed-stuck",
            Self::EmergencyStop => "emergency-stop",
            Self::StoppedByOperator => "stopped-by-operator",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "session-gone" => Some(Self::SessionGone),
            "auto-killed-stuck" => Some(Self::AutoKilledStuck),
            "emergency-stop" => Some(Self::EmergencyStop),
            "stopped-by-operator" => Some(Self::StoppedByOperator),
            _ => None,
        }
    }
}

/// One running or previously-run agent, owned by the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentRecord {
    /// Unique, stable identifier.
    pub id: String,
    /// Runtime driving the process.
    pub runtime_kind: RuntimeKind,
    /// Name of the multiplexer session the agent runs in.
    pub session_handle: String,
    /// Working directory of the session.
    pub workspace: String,
    /// Health as of the most recent tick.
    pub health: HealthState,
    /// Last observed activity.
    pub last_heartbeat: DateTime<Utc>,
    /// Size of the agent's running context.
    pub context_tokens: u64,
    /// Issue or work item this agent is working on.
    pub linked_work_item: Option<String>,
    /// When the agent was registered.
    pub started_at: DateTime<Utc>,
    /// When the agent became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the agent became terminal.
    pub completion_reason: Option<CompletionReason>,
    /// Fingerprint of the most recently captured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
}

impl AgentRecord {
    /// Construct a fresh record for a session about to be started.
    #[must_use]
    pub fn new(
        id: String,
        runtime_kind: RuntimeKind,
        session_handle: String,
        workspace: String,
        linked_work_item: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            runtime_kind,
            session_handle,
            workspace,
            health: HealthState::Active,
            last_heartbeat: now,
            context_tokens: 0,
            linked_work_item,
            started_at: now,
            completed_at: None,
            completion_reason: None,
            output_digest: None,
        }
    }

    /// Generate a short agent identifier with the given prefix.
    #[must_use]
    pub fn generate_id(prefix: &str) -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}", &uuid[..8])
    }

    /// Whether the record has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}
