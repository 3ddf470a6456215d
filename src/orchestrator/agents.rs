//! Reports coming from running agents: heartbeats and completion.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::agent::{AgentRecord, CompletionReason};
use crate::persistence::agent_repo::AgentRepo;
use crate::Result;

use super::rotation::{self, RotationDecision};

/// Reply to a heartbeat: the refreshed record and what to do about its context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatAck {
    /// Agent record after the heartbeat.
    pub agent: AgentRecord,
    /// Rotation verdict for the reported context size.
    pub rotation: RotationDecision,
}

/// Record a heartbeat and return the rotation verdict.
///
/// When `context_tokens` is omitted the previously reported size is
/// used for the verdict.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown agent or
/// `AppError::Validation` for one that is already terminal.
pub async fn record_heartbeat(
    agents: &AgentRepo,
    agent_id: &str,
    context_tokens: Option<u64>,
) -> Result<HeartbeatAck> {
    let agent = agents
        .record_heartbeat(agent_id, Utc::now(), context_tokens)
        .await?;
    let rotation = rotation::decide(agent.context_tokens);
    if rotation.should_rotate {
        info!(
            agent_id,
            context_tokens = agent.context_tokens,
            "agent context over rotation threshold"
        );
    }
    Ok(HeartbeatAck { agent, rotation })
}

/// Mark an agent finished or failed at its own request.
///
/// Reporting on an agent that is already terminal is a no-op and
/// returns the stored record unchanged.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unknown agent.
pub async fn report_completion(
    agents: &AgentRepo,
    agent_id: &str,
    success: bool,
) -> Result<AgentRecord> {
    let reason = if success {
        CompletionReason::Finished
    } else {
        CompletionReason::Failed
    };
    if agents.mark_terminal(agent_id, reason).await? {
        info!(agent_id, reason = reason.as_str(), "agent reported completion");
    }
    agents.require(agent_id).await
}
