//! Convoy orchestrator.
//!
//! A convoy is a set of agents started together from a template. Each
//! member holds only a weak reference (the agent id) to its registry
//! record; member status is refreshed from the registry on read and the
//! aggregate status is always derived, never stored.
//!
//! Work on one convoy (spawning, refresh, stop) is serialized so a stop
//! can never be overwritten by a start still in progress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::CloisterConfig;
use crate::models::agent::{AgentRecord, CompletionReason};
use crate::models::convoy::{
    Convoy, ConvoyAgentRef, ConvoyParams, ConvoyStatus, MemberStatus,
};
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::convoy_repo::ConvoyRepo;
use crate::process::{convoy_session_name, ProcessControl};
use crate::{AppError, Result};

use super::spawner::{launch_command, AgentSpawner, SpawnRequest};
use super::templates::{self, ConvoyTemplate};

/// Error text stored on members that never started because an earlier
/// member failed to spawn.
pub const NOT_STARTED: &str = "not started: an earlier member failed to spawn";

/// Result of a convoy stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyStopReport {
    /// Convoy after the stop.
    pub convoy: Convoy,
    /// Roles that were stopped.
    pub stopped: Vec<String>,
    /// Roles whose session could not be killed, with the error.
    pub failures: Vec<(String, String)>,
}

/// Starts, inspects and stops convoys.
pub struct ConvoyOrchestrator {
    config: Arc<CloisterConfig>,
    convoys: ConvoyRepo,
    agents: AgentRepo,
    spawner: AgentSpawner,
    process: Arc<dyn ProcessControl>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// How stopping one running member ended.
enum MemberStop {
    /// Killed and marked `stopped-by-operator`.
    Stopped,
    /// The agent reached a terminal state on its own first.
    Settled(AgentRecord),
    /// The agent record is gone.
    Missing,
}

fn member_prompt(convoy: &Convoy, member: &ConvoyAgentRef) -> String {
    let mut lines = vec![format!(
        "You are the {} member ({}) of convoy {} (template {}).",
        member.role, member.subagent_kind, convoy.id, convoy.template
    )];
    let params = &convoy.params;
    if !params.files.is_empty() {
        lines.push(format!("Files: {}", params.files.join(", ")));
    }
    if let Some(ref pr) = params.pr_url {
        lines.push(format!("PR: {pr}"));
    }
    if let Some(ref issue) = params.issue_id {
        lines.push(format!("Issue: {issue}"));
    }
    if let Some(ref output) = member.output_file {
        lines.push(format!("Write your result to {output}."));
    }
    lines.join("\n")
}

/// Member status implied by a terminal agent record.
async fn settled_status(member: &ConvoyAgentRef, agent: &AgentRecord) -> MemberStatus {
    match agent.completion_reason {
        Some(CompletionReason::Finished) => MemberStatus::Completed,
        Some(CompletionReason::SessionGone) => {
            let produced = match member.output_file {
                Some(ref path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => false,
            };
            if produced {
                MemberStatus::Completed
            } else {
                MemberStatus::Failed
            }
        }
        _ => MemberStatus::Failed,
    }
}

impl ConvoyOrchestrator {
    /// Orchestrator over the given stores and process seam.
    #[must_use]
    pub fn new(
        config: Arc<CloisterConfig>,
        convoys: ConvoyRepo,
        agents: AgentRepo,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        let spawner = AgentSpawner::new(Arc::clone(&process), agents.clone());
        Self {
            config,
            convoys,
            agents,
            spawner,
            process,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn convoy_lock(&self, convoy_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(convoy_id.to_owned()).or_default())
    }

    /// Templates available to [`start`](Self::start).
    #[must_use]
    pub fn templates(&self) -> Vec<ConvoyTemplate> {
        templates::available_templates(&self.config)
    }

    /// Start a convoy from `template`.
    ///
    /// Members are spawned in template order. If one fails to spawn,
    /// it and every member after it are marked failed and spawning
    /// stops; the convoy is still returned so it can be inspected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::TemplateNotFound` before anything is spawned
    /// if the template is unknown, or `AppError::Io`/`AppError::Db` if
    /// the convoy cannot be set up.
    pub async fn start(&self, template: &str, params: ConvoyParams) -> Result<Convoy> {
        let template = templates::resolve(&self.config, template)?;
        let id = Convoy::generate_id();
        let output_dir = self.config.convoy_output_root().join(&id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|err| AppError::Io(format!("failed to create convoy output dir: {err}")))?;

        let members = template
            .roles
            .iter()
            .map(|r| {
                let output = output_dir.join(format!("{}.md", r.role));
                ConvoyAgentRef::pending(
                    r.role.clone(),
                    r.subagent_kind.clone(),
                    Some(output.to_string_lossy().into_owned()),
                )
            })
            .collect();

        let mut convoy = Convoy::new(
            template.name.clone(),
            output_dir.to_string_lossy().into_owned(),
            params,
            members,
        );
        convoy.id = id;

        let lock = self.convoy_lock(&convoy.id).await;
        let _serialized = lock.lock().await;
        self.convoys.create(&convoy).await?;

        let span = info_span!("convoy_start", convoy_id = %convoy.id, template = %convoy.template);
        self.spawn_members(&mut convoy).instrument(span).await?;
        Ok(convoy)
    }

    async fn spawn_members(&self, convoy: &mut Convoy) -> Result<()> {
        let workspace = convoy
            .params
            .project_path
            .as_ref()
            .map_or_else(|| PathBuf::from(&convoy.output_dir), PathBuf::from);

        for index in 0..convoy.agents.len() {
            let agent_id = AgentRecord::generate_id("agent");
            let prompt = member_prompt(convoy, &convoy.agents[index]);
            let agents = &self.config.agents;
            let request = SpawnRequest {
                session_name: convoy_session_name(&convoy.id, &convoy.agents[index].role),
                command: Some(launch_command(
                    &agent_id,
                    self.config.http_port,
                    &agents.host_cli,
                    &agents.host_cli_args,
                    Some(&prompt),
                )),
                agent_id,
                workspace: workspace.clone(),
                runtime_kind: agents.runtime_kind,
                linked_work_item: convoy.params.issue_id.clone(),
            };

            match self.spawner.spawn(request).await {
                Ok(agent) => {
                    let member = &mut convoy.agents[index];
                    member.agent_id = Some(agent.id);
                    member.transition(MemberStatus::Running);
                    self.persist(convoy).await?;
                }
                Err(err) => {
                    warn!(
                        role = %convoy.agents[index].role,
                        %err,
                        "convoy member failed to spawn; remaining members not started"
                    );
                    let member = &mut convoy.agents[index];
                    member.error = Some(err.to_string());
                    member.transition(MemberStatus::Failed);
                    for later in &mut convoy.agents[index + 1..] {
                        later.error = Some(NOT_STARTED.to_owned());
                        later.transition(MemberStatus::Failed);
                    }
                    self.persist(convoy).await?;
                    return Ok(());
                }
            }
        }

        info!(members = convoy.agents.len(), "convoy started");
        Ok(())
    }

    async fn persist(&self, convoy: &mut Convoy) -> Result<()> {
        convoy.recompute_status();
        self.convoys.update(convoy).await
    }

    async fn load(&self, convoy_id: &str) -> Result<Convoy> {
        self.convoys
            .get_by_id(convoy_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("convoy {convoy_id} not found")))
    }

    /// Pull member outcomes from the registry; persists only on change.
    async fn refresh(&self, convoy: &mut Convoy) -> Result<()> {
        let mut changed = false;
        for member in &mut convoy.agents {
            if member.status != MemberStatus::Running {
                continue;
            }
            let Some(ref agent_id) = member.agent_id else {
                continue;
            };
            let next = match self.agents.get_by_id(agent_id).await? {
                Some(agent) if agent.is_terminal() => {
                    let next = settled_status(member, &agent).await;
                    if next == MemberStatus::Failed {
                        member.error = agent
                            .completion_reason
                            .map(|r| r.as_str().to_owned());
                    }
                    next
                }
                Some(_) => continue,
                None => {
                    member.error = Some("agent record no longer exists".into());
                    MemberStatus::Failed
                }
            };
            changed |= member.transition(next);
        }

        let was_terminal = convoy.completed_at.is_some();
        convoy.recompute_status();
        if changed || (!was_terminal && convoy.completed_at.is_some()) {
            self.convoys.update(convoy).await?;
            if convoy.status.is_terminal() {
                info!(convoy_id = %convoy.id, status = convoy.status.as_str(), "convoy finished");
            }
        }
        Ok(())
    }

    /// Current convoy state with member statuses refreshed from the registry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy.
    pub async fn status(&self, convoy_id: &str) -> Result<Convoy> {
        let lock = self.convoy_lock(convoy_id).await;
        let _serialized = lock.lock().await;
        self.load_refreshed(convoy_id).await
    }

    async fn load_refreshed(&self, convoy_id: &str) -> Result<Convoy> {
        let mut convoy = self.load(convoy_id).await?;
        self.refresh(&mut convoy).await?;
        Ok(convoy)
    }

    /// All convoys, most recently started first, optionally filtered by
    /// aggregate status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn list(&self, filter: Option<ConvoyStatus>) -> Result<Vec<Convoy>> {
        let mut convoys = self.convoys.list().await?;
        for convoy in &mut convoys {
            if !convoy.status.is_terminal() {
                *convoy = self.status(&convoy.id).await?;
            }
        }
        Ok(convoys
            .into_iter()
            .filter(|c| filter.is_none_or(|wanted| c.status == wanted))
            .collect())
    }

    /// Stop every non-terminal member.
    ///
    /// Running members are sent an interrupt first unless `force` is
    /// set, then killed. Killed members are marked failed and their
    /// agents terminal `stopped-by-operator`; members whose kill fails
    /// stay running and are reported. A member whose agent finished on
    /// its own before it could be stopped keeps that outcome. A stop
    /// issued while the convoy is still starting waits for the start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown convoy.
    pub async fn stop(&self, convoy_id: &str, force: bool) -> Result<ConvoyStopReport> {
        let span = info_span!("convoy_stop", convoy_id, force);
        async move {
            let lock = self.convoy_lock(convoy_id).await;
            let _serialized = lock.lock().await;
            self.stop_members(convoy_id, force).await
        }
        .instrument(span)
        .await
    }

    async fn stop_members(&self, convoy_id: &str, force: bool) -> Result<ConvoyStopReport> {
        let mut convoy = self.load_refreshed(convoy_id).await?;
        let mut stopped = Vec::new();
        for member in &mut convoy.agents {
            if member.status == MemberStatus::Pending {
                member.error = Some(CompletionReason::StoppedByOperator.as_str().to_owned());
                member.transition(MemberStatus::Failed);
                stopped.push(member.role.clone());
            }
        }

        let targets: Vec<(usize, String, String)> = convoy
            .agents
            .iter()
            .enumerate()
            .filter(|(_, m)| m.status == MemberStatus::Running)
            .filter_map(|(i, m)| m.agent_id.clone().map(|id| (i, m.role.clone(), id)))
            .collect();

        let outcomes = join_all(
            targets
                .iter()
                .map(|(_, _, agent_id)| self.stop_agent(agent_id, force)),
        )
        .await;

        let mut failures = Vec::new();
        for ((index, role, _), outcome) in targets.into_iter().zip(outcomes) {
            let member = &mut convoy.agents[index];
            match outcome {
                Ok(MemberStop::Stopped) => {
                    member.error = Some(CompletionReason::StoppedByOperator.as_str().to_owned());
                    member.transition(MemberStatus::Failed);
                    stopped.push(role);
                }
                Ok(MemberStop::Settled(agent)) => {
                    let next = settled_status(member, &agent).await;
                    if next == MemberStatus::Failed {
                        member.error = agent.completion_reason.map(|r| r.as_str().to_owned());
                    }
                    member.transition(next);
                    debug!(role, status = ?next, "member finished before it was stopped");
                }
                Ok(MemberStop::Missing) => {
                    member.error = Some("agent record no longer exists".into());
                    member.transition(MemberStatus::Failed);
                }
                Err(err) => {
                    warn!(role, %err, "failed to stop convoy member");
                    failures.push((role, err.to_string()));
                }
            }
        }

        self.persist(&mut convoy).await?;
        info!(
            stopped = stopped.len(),
            failed = failures.len(),
            "convoy stopped"
        );
        Ok(ConvoyStopReport {
            convoy,
            stopped,
            failures,
        })
    }

    async fn stop_agent(&self, agent_id: &str, force: bool) -> Result<MemberStop> {
        let Some(agent) = self.agents.get_by_id(agent_id).await? else {
            return Ok(MemberStop::Missing);
        };
        if agent.is_terminal() {
            return Ok(MemberStop::Settled(agent));
        }
        if !force {
            if let Err(err) = self.process.interrupt(&agent.session_handle).await {
                warn!(agent_id, %err, "interrupt before stop failed");
            }
        }
        self.process.kill(&agent.session_handle).await?;
        if self
            .agents
            .mark_terminal(agent_id, CompletionReason::StoppedByOperator)
            .await?
        {
            Ok(MemberStop::Stopped)
        } else {
            // The agent reported its own outcome while being stopped.
            Ok(MemberStop::Settled(self.agents.require(agent_id).await?))
        }
    }
}
