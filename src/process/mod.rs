//! Process-control seam over terminal-multiplexer sessions.
//!
//! Every agent runs inside a named session. The supervisor only ever
//! creates, probes, types into, reads from and kills those sessions; the
//! [`ProcessControl`] trait is the whole surface. Production uses
//! [`tmux::TmuxSessions`]; tests use [`memory::InMemorySessions`].

pub mod memory;
pub mod tmux;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::{AppError, Result};

/// Prefix shared by every session the supervisor creates.
pub const SESSION_PREFIX: &str = "cloister";

/// Opaque named-session primitive.
///
/// Implementations must be safe to call concurrently for different
/// session names.
pub trait ProcessControl: Send + Sync {
    /// Whether a session with this exact name is alive.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if the probe cannot be executed.
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Start a detached session in `cwd`, optionally running `command`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if the session cannot be started.
    fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Type `text` into the session followed by Enter.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if the keystrokes cannot be sent.
    fn send_input(
        &self,
        name: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask the foreground program to stop what it is doing (Ctrl-C).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if the signal cannot be delivered.
    fn interrupt(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Return the last `lines` lines of visible output.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if the session cannot be read.
    fn capture_recent_output(
        &self,
        name: &str,
        lines: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Destroy the session. Killing a session that is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ExternalTool`] if a live session could not be killed.
    fn kill(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

static UNSAFE_NAME_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").ok());

/// Replace characters the multiplexer treats specially (`.`, `:`,
/// whitespace) with `-`.
#[must_use]
pub fn sanitize_session_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let cleaned = match UNSAFE_NAME_CHARS.as_ref() {
        Some(re) => re.replace_all(trimmed, "-").into_owned(),
        None => trimmed.to_owned(),
    };
    cleaned.trim_matches('-').to_owned()
}

/// Session name for an ad-hoc agent.
#[must_use]
pub fn agent_session_name(agent_id: &str) -> String {
    sanitize_session_name(&format!("{SESSION_PREFIX}-agent-{agent_id}"))
}

/// Session name for one convoy member.
#[must_use]
pub fn convoy_session_name(convoy_id: &str, role: &str) -> String {
    sanitize_session_name(&format!("{SESSION_PREFIX}-{convoy_id}-{role}"))
}

/// Quote one argument for a POSIX shell command line.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Run `op` with an upper bound of `timeout`, retrying exactly once if
/// the first attempt times out.
///
/// Errors returned by `op` itself are surfaced immediately; only
/// timeouts are retried.
///
/// # Errors
///
/// Returns the error from `op`, or [`AppError::ExternalTool`] if both
/// attempts time out.
pub async fn bounded<T, F, Fut>(label: &str, timeout: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=2_u8 {
        if let Ok(result) = tokio::time::timeout(timeout, op()).await {
            return result;
        }
        warn!(label, attempt, timeout_ms = timeout.as_millis(), "process call timed out");
    }
    Err(AppError::ExternalTool(format!(
        "{label} timed out after {}ms (retried once)",
        timeout.as_millis()
    )))
}
