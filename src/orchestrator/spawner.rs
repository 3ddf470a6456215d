//! Agent spawner.
//!
//! Starts a host CLI inside a new multiplexer session and registers the
//! resulting [`AgentRecord`]. The agent learns its identity and the
//! supervisor's HTTP port through `CLOISTER_AGENT_ID` and
//! `CLOISTER_HTTP_PORT`, which it uses to report heartbeats.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::models::agent::{AgentRecord, RuntimeKind};
use crate::persistence::agent_repo::AgentRepo;
use crate::process::{shell_quote, ProcessControl};
use crate::Result;

/// Everything needed to start one agent.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Identifier for the new agent record.
    pub agent_id: String,
    /// Session name to create.
    pub session_name: String,
    /// Working directory of the session.
    pub workspace: PathBuf,
    /// Shell command line to run; `None` starts an interactive shell.
    pub command: Option<String>,
    /// Runtime kind recorded on the agent.
    pub runtime_kind: RuntimeKind,
    /// Work item the agent is linked to.
    pub linked_work_item: Option<String>,
}

/// Build the shell command line that launches a host CLI for `agent_id`.
///
/// `args` are passed through as-is; `prompt`, when present, is the
/// final argument.
#[must_use]
pub fn launch_command(
    agent_id: &str,
    http_port: u16,
    host_cli: &str,
    args: &[String],
    prompt: Option<&str>,
) -> String {
    let mut parts = vec![
        "env".to_owned(),
        format!("CLOISTER_AGENT_ID={}", shell_quote(agent_id)),
        format!("CLOISTER_HTTP_PORT={http_port}"),
        shell_quote(host_cli),
    ];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    if let Some(prompt) = prompt {
        parts.push(shell_quote(prompt));
    }
    parts.join(" ")
}

/// Creates sessions and their registry records.
#[derive(Clone)]
pub struct AgentSpawner {
    process: Arc<dyn ProcessControl>,
    agents: AgentRepo,
}

impl AgentSpawner {
    /// Spawner over the given process seam and registry.
    #[must_use]
    pub fn new(process: Arc<dyn ProcessControl>, agents: AgentRepo) -> Self {
        Self { process, agents }
    }

    /// Start the session and register the agent.
    ///
    /// No record is written if the session cannot be started. If the
    /// record cannot be written the freshly created session is killed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalTool` if the session cannot be created
    /// or `AppError::Db` if the record cannot be stored.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentRecord> {
        let span = info_span!(
            "spawn_agent",
            agent_id = %request.agent_id,
            session = %request.session_name
        );
        async move {
            self.process
                .create(
                    &request.session_name,
                    &request.workspace,
                    request.command.as_deref(),
                )
                .await?;

            let record = AgentRecord::new(
                request.agent_id,
                request.runtime_kind,
                request.session_name,
                request.workspace.to_string_lossy().into_owned(),
                request.linked_work_item,
            );

            match self.agents.create(&record).await {
                Ok(created) => {
                    info!(workspace = %created.workspace, "agent spawned");
                    Ok(created)
                }
                Err(err) => {
                    if let Err(kill_err) = self.process.kill(&record.session_handle).await {
                        warn!(%kill_err, "failed to clean up session after registry error");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
