//! Health monitor: periodic liveness classification with auto-actions.
//!
//! Each tick walks every live agent in the registry, infers activity
//! from its captured output, classifies it by silence, and reacts to
//! transitions: a poke on entering `warning`, a kill on entering
//! `stuck`. Only one tick runs at a time; a tick requested while one
//! is in flight is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{AutoActionConfig, CloisterConfig, ThresholdConfig};
use crate::models::agent::{AgentRecord, CompletionReason};
use crate::models::health::{classify, HealthCounts, HealthState};
use crate::persistence::agent_repo::AgentRepo;
use crate::process::ProcessControl;
use crate::{AppError, Result};

/// One agent moving between health buckets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthTransition {
    /// Agent concerned.
    pub agent_id: String,
    /// Previous classification.
    pub from: HealthState,
    /// New classification.
    pub to: HealthState,
}

/// A per-agent failure collected during a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentFailure {
    /// Agent concerned.
    pub agent_id: String,
    /// Human-readable error.
    pub error: String,
}

/// What a single tick saw and did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TickReport {
    /// Tick start.
    pub started_at: DateTime<Utc>,
    /// Tick end.
    pub finished_at: DateTime<Utc>,
    /// Live agents examined.
    pub checked: usize,
    /// Classification changes.
    pub transitions: Vec<HealthTransition>,
    /// Agents that were poked.
    pub poked: Vec<String>,
    /// Agents killed after going stuck.
    pub killed: Vec<String>,
    /// Agents whose session had disappeared.
    pub session_gone: Vec<String>,
    /// Per-agent failures; never abort the tick.
    pub failures: Vec<AgentFailure>,
}

impl TickReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            checked: 0,
            transitions: Vec::new(),
            poked: Vec::new(),
            killed: Vec::new(),
            session_gone: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, agent_id: &str, err: &AppError) {
        self.failures.push(AgentFailure {
            agent_id: agent_id.to_owned(),
            error: err.to_string(),
        });
    }
}

/// An agent surfaced as needing attention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AttentionItem {
    /// Agent concerned.
    pub agent_id: String,
    /// Current classification.
    pub health: HealthState,
    /// Whole minutes since the last heartbeat.
    pub minutes_silent: i64,
    /// Session the agent runs in.
    pub session_handle: String,
}

/// Read-only snapshot of the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogStatus {
    /// Whether the periodic scheduler is running.
    pub running: bool,
    /// Whether a tick is executing right now.
    pub ticking: bool,
    /// Live agents per health bucket.
    pub counts: HealthCounts,
    /// Agents in `warning` or `stuck`.
    pub needs_attention: Vec<AttentionItem>,
    /// Active thresholds.
    pub thresholds: ThresholdConfig,
    /// Active auto-actions.
    pub auto_actions: AutoActionConfig,
    /// Seconds between scheduled ticks.
    pub tick_interval_seconds: u64,
    /// Report of the most recent completed tick.
    pub last_tick: Option<TickReport>,
}

/// Outcome of an emergency stop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EmergencyStopReport {
    /// Agents whose sessions were killed.
    pub killed: Vec<String>,
    /// Agents that could not be killed; they stay live.
    pub failures: Vec<AgentFailure>,
}

/// Fingerprint of captured output.
#[must_use]
pub fn output_digest(output: &str) -> String {
    format!("{:x}", Sha256::digest(output.trim_end().as_bytes()))
}

struct Scheduler {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Resets the single-flight flag when a tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Watchdog over every live agent.
pub struct HealthMonitor {
    config: Arc<CloisterConfig>,
    agents: AgentRepo,
    process: Arc<dyn ProcessControl>,
    ticking: AtomicBool,
    scheduler: Mutex<Option<Scheduler>>,
    last_tick: Mutex<Option<TickReport>>,
}

impl HealthMonitor {
    /// Monitor over the given registry and process seam.
    #[must_use]
    pub fn new(
        config: Arc<CloisterConfig>,
        agents: AgentRepo,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            config,
            agents,
            process,
            ticking: AtomicBool::new(false),
            scheduler: Mutex::new(None),
            last_tick: Mutex::new(None),
        }
    }

    /// Run one classification pass over all live agents.
    ///
    /// Returns `Ok(None)` if another tick was already running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the live agent list cannot be read;
    /// per-agent failures are collected in the report.
    pub async fn tick(&self) -> Result<Option<TickReport>> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("tick already in flight; skipping");
            return Ok(None);
        }
        let _guard = TickGuard(&self.ticking);

        let mut report = TickReport::begin();
        let live = self.agents.list_live().await?;
        report.checked = live.len();

        for agent in live {
            let span = info_span!("health_check", agent_id = %agent.id);
            self.check_agent(agent, &mut report).instrument(span).await;
        }

        report.finished_at = Utc::now();
        if !report.failures.is_empty() {
            warn!(failures = report.failures.len(), "tick completed with failures");
        }
        debug!(
            checked = report.checked,
            transitions = report.transitions.len(),
            "tick completed"
        );
        *self.last_tick.lock().await = Some(report.clone());
        Ok(Some(report))
    }

    async fn check_agent(&self, mut agent: AgentRecord, report: &mut TickReport) {
        let session = agent.session_handle.clone();

        match self.process.exists(&session).await {
            Ok(true) => {}
            Ok(false) => {
                match self
                    .agents
                    .mark_terminal(&agent.id, CompletionReason::SessionGone)
                    .await
                {
                    Ok(true) => {
                        info!(agent_id = %agent.id, session, "session gone; agent marked terminal");
                        report.session_gone.push(agent.id);
                    }
                    Ok(false) => {
                        debug!(agent_id = %agent.id, "agent finished before its session went away");
                    }
                    Err(err) => report.fail(&agent.id, &err),
                }
                return;
            }
            Err(err) => {
                report.fail(&agent.id, &err);
                return;
            }
        }

        match self
            .process
            .capture_recent_output(&session, self.config.process.capture_lines)
            .await
        {
            Ok(output) => {
                let digest = output_digest(&output);
                let changed = agent
                    .output_digest
                    .as_deref()
                    .is_some_and(|previous| previous != digest);
                let heartbeat = changed.then(Utc::now);
                if agent.output_digest.as_deref() != Some(digest.as_str()) {
                    if let Err(err) = self
                        .agents
                        .update_output_digest(&agent.id, &digest, heartbeat)
                        .await
                    {
                        report.fail(&agent.id, &err);
                    }
                }
            }
            Err(err) => report.fail(&agent.id, &err),
        }

        // Heartbeats and completion reports may have landed while the
        // session was being read; act only on the stored record.
        agent = match self.agents.get_by_id(&agent.id).await {
            Ok(Some(fresh)) if !fresh.is_terminal() => fresh,
            Ok(_) => {
                debug!(agent_id = %agent.id, "agent finished during check; skipping");
                return;
            }
            Err(err) => {
                report.fail(&agent.id, &err);
                return;
            }
        };

        let now = Utc::now();
        let previous = agent.health;
        let current = classify(now, agent.last_heartbeat, &self.config.thresholds);
        let mut persisted = current;

        if current == HealthState::Warning
            && previous < HealthState::Warning
            && self.config.auto_actions.poke_on_warning
        {
            match self
                .process
                .send_input(&session, &self.config.process.poke_message)
                .await
            {
                Ok(()) => {
                    info!(agent_id = %agent.id, session, "poked quiet agent");
                    report.poked.push(agent.id.clone());
                    // The poke counts as delivered even if the baseline
                    // cannot be refreshed.
                    if let Err(err) = self.refresh_baseline(&agent).await {
                        report.fail(&agent.id, &err);
                    }
                }
                Err(err) => {
                    report.fail(&agent.id, &err);
                    persisted = previous;
                }
            }
        }

        let mut killed = false;
        if current == HealthState::Stuck
            && previous != HealthState::Stuck
            && self.config.auto_actions.kill_on_stuck
        {
            match self.process.kill(&session).await {
                Ok(()) => killed = true,
                Err(err) => {
                    // Leaving the stored health untouched retries the kill next tick.
                    report.fail(&agent.id, &err);
                    persisted = previous;
                }
            }
        }

        if persisted != previous {
            info!(
                agent_id = %agent.id,
                from = previous.as_str(),
                to = persisted.as_str(),
                "health transition"
            );
            match self.agents.update_health(&agent.id, persisted).await {
                Ok(()) => report.transitions.push(HealthTransition {
                    agent_id: agent.id.clone(),
                    from: previous,
                    to: persisted,
                }),
                Err(err) => report.fail(&agent.id, &err),
            }
        }

        if killed {
            match self
                .agents
                .mark_terminal(&agent.id, CompletionReason::AutoKilledStuck)
                .await
            {
                Ok(false) => debug!(agent_id = %agent.id, "agent finished while being killed"),
                Ok(true) => {
                    warn!(agent_id = %agent.id, session, "stuck agent killed");
                    report.killed.push(agent.id);
                }
                Err(err) => report.fail(&agent.id, &err),
            }
        }
    }

    /// Store the output that follows a poke as the new baseline so the
    /// echoed probe is not mistaken for activity.
    async fn refresh_baseline(&self, agent: &AgentRecord) -> Result<()> {
        let output = self
            .process
            .capture_recent_output(&agent.session_handle, self.config.process.capture_lines)
            .await?;
        self.agents
            .update_output_digest(&agent.id, &output_digest(&output), None)
            .await
    }

    /// Aggregate status derived from the registry; performs no process I/O.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the registry cannot be read.
    pub async fn get_status(&self) -> Result<WatchdogStatus> {
        let now = Utc::now();
        let mut counts = HealthCounts::default();
        let mut needs_attention = Vec::new();

        for agent in self.agents.list_live().await? {
            let health = classify(now, agent.last_heartbeat, &self.config.thresholds);
            counts.record(health);
            if health.needs_attention() {
                needs_attention.push(AttentionItem {
                    minutes_silent: (now - agent.last_heartbeat).num_minutes(),
                    agent_id: agent.id,
                    health,
                    session_handle: agent.session_handle,
                });
            }
        }

        Ok(WatchdogStatus {
            running: self.is_running().await,
            ticking: self.ticking.load(Ordering::SeqCst),
            counts,
            needs_attention,
            thresholds: self.config.thresholds,
            auto_actions: self.config.auto_actions,
            tick_interval_seconds: self.config.tick_interval_seconds,
            last_tick: self.last_tick.lock().await.clone(),
        })
    }

    /// Kill every live agent's session concurrently.
    ///
    /// Agents whose kill succeeds are marked terminal `emergency-stop`;
    /// the rest are reported and left live.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the live agent list cannot be read.
    pub async fn emergency_stop(&self) -> Result<EmergencyStopReport> {
        let live = self.agents.list_live().await?;
        warn!(agents = live.len(), "emergency stop requested");

        let outcomes = join_all(live.iter().map(|agent| async move {
            self.process.kill(&agent.session_handle).await?;
            self.agents
                .mark_terminal(&agent.id, CompletionReason::EmergencyStop)
                .await?;
            Ok::<(), AppError>(())
        }))
        .await;

        let mut report = EmergencyStopReport::default();
        for (agent, outcome) in live.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.killed.push(agent.id),
                Err(err) => {
                    error!(agent_id = %agent.id, %err, "emergency stop failed for agent");
                    report.failures.push(AgentFailure {
                        agent_id: agent.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        warn!(
            killed = report.killed.len(),
            failed = report.failures.len(),
            "emergency stop completed"
        );
        Ok(report)
    }

    /// Start the periodic scheduler. Returns `false` if it was already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        let period = self.config.tick_interval();
        let handle = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            info!("health monitor scheduler stopped");
                            break;
                        }
                        _ = interval.tick() => {
                            if let Err(err) = monitor.tick().await {
                                error!(%err, "health monitor tick failed");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("health_monitor")),
        );

        *scheduler = Some(Scheduler {
            cancel,
            _handle: handle,
        });
        info!(interval_secs = period.as_secs(), "health monitor started");
        true
    }

    /// Stop the periodic scheduler. Returns `false` if it was not running.
    ///
    /// Agent sessions are never touched and a tick already in flight
    /// runs to completion.
    pub async fn stop(&self) -> bool {
        let Some(scheduler) = self.scheduler.lock().await.take() else {
            return false;
        };
        scheduler.cancel.cancel();
        info!("health monitor stop requested");
        true
    }

    /// Whether the periodic scheduler is running.
    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }
}
