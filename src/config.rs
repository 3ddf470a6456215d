//! Supervisor configuration parsing and validation.
//!
//! The configuration is read once at process start and stays immutable
//! for the lifetime of the run; changing it requires a restart.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::agent::RuntimeKind;
use crate::{AppError, Result};

/// Health classification thresholds, in minutes since the last heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ThresholdConfig {
    /// Minutes of silence before an agent is considered stale.
    #[serde(default = "default_stale_minutes")]
    pub stale: u64,
    /// Minutes of silence before an agent needs attention.
    #[serde(default = "default_warning_minutes")]
    pub warning: u64,
    /// Minutes of silence before an agent is considered stuck.
    #[serde(default = "default_stuck_minutes")]
    pub stuck: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            stale: default_stale_minutes(),
            warning: default_warning_minutes(),
            stuck: default_stuck_minutes(),
        }
    }
}

impl ThresholdConfig {
    /// Check the `stale <= warning <= stuck` ordering.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the ordering is violated.
    pub fn validate(&self) -> Result<()> {
        if self.stale > self.warning || self.warning > self.stuck {
            return Err(AppError::Config(format!(
                "thresholds must satisfy stale <= warning <= stuck (got {}/{}/{})",
                self.stale, self.warning, self.stuck
            )));
        }
        Ok(())
    }
}

fn default_stale_minutes() -> u64 {
    5
}

fn default_warning_minutes() -> u64 {
    15
}

fn default_stuck_minutes() -> u64 {
    30
}

/// Corrective actions the health monitor may take without a human.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AutoActionConfig {
    /// Send a liveness probe when an agent enters `warning`.
    #[serde(default = "default_true")]
    pub poke_on_warning: bool,
    /// Kill the session when an agent enters `stuck`.
    #[serde(default)]
    pub kill_on_stuck: bool,
}

impl Default for AutoActionConfig {
    fn default() -> Self {
        Self {
            poke_on_warning: true,
            kill_on_stuck: false,
        }
    }
}

/// Startup behaviour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StartupConfig {
    /// Start the health monitor scheduler as soon as the daemon boots.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { auto_start: true }
    }
}

/// Terminal multiplexer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Multiplexer binary.
    #[serde(default = "default_tmux_binary")]
    pub tmux_binary: String,
    /// Upper bound for a single create/kill/send/capture call.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    /// Number of trailing output lines captured per activity check.
    #[serde(default = "default_capture_lines")]
    pub capture_lines: u32,
    /// Input sent to an agent that has gone quiet.
    #[serde(default = "default_poke_message")]
    pub poke_message: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            tmux_binary: default_tmux_binary(),
            command_timeout_seconds: default_command_timeout(),
            capture_lines: default_capture_lines(),
            poke_message: default_poke_message(),
        }
    }
}

fn default_tmux_binary() -> String {
    "tmux".into()
}

fn default_command_timeout() -> u64 {
    10
}

fn default_capture_lines() -> u32 {
    50
}

fn default_poke_message() -> String {
    "Status check from the supervisor: reply with a short progress update if you are still working."
        .into()
}

/// How ad-hoc and convoy agents are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentLaunchConfig {
    /// Host CLI binary (e.g. `claude`).
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments placed before the task prompt.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Runtime kind recorded on spawned agents.
    #[serde(default)]
    pub runtime_kind: RuntimeKind,
}

impl Default for AgentLaunchConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
            runtime_kind: RuntimeKind::default(),
        }
    }
}

/// How specialist agents are launched and resumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpecialistLaunchConfig {
    /// Host CLI binary used for specialists.
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Arguments placed before any resume flag.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Flag that precedes a saved session identifier on resume.
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Working directory for specialist sessions; defaults to `state_dir`.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl Default for SpecialistLaunchConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
            resume_flag: default_resume_flag(),
            workspace: None,
        }
    }
}

fn default_host_cli() -> String {
    "claude".into()
}

fn default_resume_flag() -> String {
    "--resume".into()
}

/// One role inside a configured convoy template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TemplateRoleConfig {
    /// Role name, unique within the template.
    pub role: String,
    /// Sub-agent definition the role runs as.
    pub subagent_kind: String,
}

/// A convoy template declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyTemplateConfig {
    /// Optional human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered roles.
    pub roles: Vec<TemplateRoleConfig>,
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    7420
}

fn default_ipc_name() -> String {
    "cloister".into()
}

fn default_tick_interval() -> u64 {
    60
}

fn default_retention_days() -> u32 {
    30
}

/// Process-wide supervisor configuration parsed from `cloister.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CloisterConfig {
    /// Directory holding the database and convoy output.
    pub state_dir: PathBuf,
    /// Port for the HTTP boundary.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier for `cloister-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Seconds between health monitor ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Days a terminal record is kept before purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Health thresholds.
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Automatic corrective actions.
    #[serde(default)]
    pub auto_actions: AutoActionConfig,
    /// Startup behaviour.
    #[serde(default)]
    pub startup: StartupConfig,
    /// Terminal multiplexer settings.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Launch settings for ad-hoc and convoy agents.
    #[serde(default)]
    pub agents: AgentLaunchConfig,
    /// Launch settings for specialists.
    #[serde(default)]
    pub specialists: SpecialistLaunchConfig,
    /// Extra convoy templates keyed by name.
    #[serde(default)]
    pub convoy_templates: HashMap<String, ConvoyTemplateConfig>,
}

impl CloisterConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("cloister.db")
    }

    /// Root directory under which each convoy gets its output directory.
    #[must_use]
    pub fn convoy_output_root(&self) -> PathBuf {
        self.state_dir.join("convoys")
    }

    /// Working directory for specialist sessions.
    #[must_use]
    pub fn specialist_workspace(&self) -> PathBuf {
        self.specialists
            .workspace
            .clone()
            .unwrap_or_else(|| self.state_dir.clone())
    }

    /// Interval between scheduled health monitor ticks.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    /// Upper bound for one process-control call.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.process.command_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        if self.state_dir.as_os_str().is_empty() {
            return Err(AppError::Config("state_dir must not be empty".into()));
        }

        if self.tick_interval_seconds == 0 {
            return Err(AppError::Config(
                "tick_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.process.command_timeout_seconds == 0 {
            return Err(AppError::Config(
                "process.command_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.agents.host_cli.trim().is_empty() || self.specialists.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }

        for (name, template) in &self.convoy_templates {
            if template.roles.is_empty() {
                return Err(AppError::Config(format!(
                    "convoy template '{name}' must declare at least one role"
                )));
            }
            let mut seen = HashSet::new();
            for role in &template.roles {
                if !seen.insert(role.role.as_str()) {
                    return Err(AppError::Config(format!(
                        "convoy template '{name}' declares role '{}' twice",
                        role.role
                    )));
                }
            }
        }

        Ok(())
    }
}
