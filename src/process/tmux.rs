//! tmux-backed [`ProcessControl`] adapter.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{bounded, ProcessControl};
use crate::config::ProcessConfig;
use crate::{AppError, Result};

/// Sessions managed through the `tmux` command line.
#[derive(Debug, Clone)]
pub struct TmuxSessions {
    binary: String,
    timeout: Duration,
}

impl TmuxSessions {
    /// Adapter invoking `binary` with a per-call `timeout`.
    #[must_use]
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Adapter built from the `[process]` config section.
    #[must_use]
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            config.tmux_binary.clone(),
            Duration::from_secs(config.command_timeout_seconds),
        )
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| AppError::ExternalTool(format!("failed to run tmux: {err}")))
    }

    async fn run(&self, label: &str, args: &[String]) -> Result<Output> {
        debug!(label, ?args, "tmux");
        bounded(label, self.timeout, || self.output(args)).await
    }

    async fn run_checked(&self, label: &str, args: &[String]) -> Result<Output> {
        let output = self.run(label, args).await?;
        checked(label, output)
    }

    /// `new-session` is not idempotent: after a timeout the session may
    /// exist anyway, so look before trying again.
    async fn new_session(&self, name: &str, args: &[String]) -> Result<()> {
        let label = "tmux new-session";
        debug!(label, ?args, "tmux");
        let output = match tokio::time::timeout(self.timeout, self.output(args)).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    label,
                    session = name,
                    timeout_ms = self.timeout.as_millis(),
                    "process call timed out"
                );
                if self.has_session(name).await? {
                    return Ok(());
                }
                tokio::time::timeout(self.timeout, self.output(args))
                    .await
                    .map_err(|_| {
                        AppError::ExternalTool(format!(
                            "{label} timed out after {}ms (retried once)",
                            self.timeout.as_millis()
                        ))
                    })??
            }
        };
        checked(label, output)?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let args = vec!["has-session".into(), "-t".into(), format!("={name}")];
        Ok(self.run("tmux has-session", &args).await?.status.success())
    }
}

fn checked(label: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(AppError::ExternalTool(format!(
            "{label} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_owned()).collect()
}

/// Pane target that only matches the session named exactly `name`.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

impl ProcessControl for TmuxSessions {
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move { self.has_session(&name).await })
    }

    fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        let mut args = owned(&["new-session", "-d", "-s", &name, "-c"]);
        args.push(cwd.to_string_lossy().into_owned());
        if let Some(command) = command {
            args.push(command.to_owned());
        }
        Box::pin(async move { self.new_session(&name, &args).await })
    }

    fn send_input(
        &self,
        name: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let target = pane_target(name);
        let literal = owned(&["send-keys", "-t", &target, "-l", text]);
        let enter = owned(&["send-keys", "-t", &target, "Enter"]);
        Box::pin(async move {
            self.run_checked("tmux send-keys", &literal).await?;
            self.run_checked("tmux send-keys", &enter).await?;
            Ok(())
        })
    }

    fn interrupt(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let args = owned(&["send-keys", "-t", &pane_target(name), "C-c"]);
        Box::pin(async move {
            self.run_checked("tmux send-keys", &args).await?;
            Ok(())
        })
    }

    fn capture_recent_output(
        &self,
        name: &str,
        lines: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let start = format!("-{lines}");
        let args = owned(&["capture-pane", "-p", "-t", &pane_target(name), "-S", &start]);
        Box::pin(async move {
            let output = self.run_checked("tmux capture-pane", &args).await?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }

    fn kill(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            let args = vec!["kill-session".into(), "-t".into(), format!("={name}")];
            let output = self.run("tmux kill-session", &args).await?;
            if output.status.success() || !self.has_session(&name).await? {
                return Ok(());
            }
            Err(AppError::ExternalTool(format!(
                "tmux kill-session failed for {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        })
    }
}
