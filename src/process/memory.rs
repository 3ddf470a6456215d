//! In-memory [`ProcessControl`] adapter.
//!
//! Sessions are plain map entries. Input sent to a session is echoed
//! into its output the way a terminal would, and individual operations
//! can be made to fail so error paths are reproducible.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;

use super::ProcessControl;
use crate::{AppError, Result};

/// One fake session.
#[derive(Debug, Clone, Default)]
pub struct FakeSession {
    /// Working directory passed to `create`.
    pub cwd: PathBuf,
    /// Command passed to `create`.
    pub command: Option<String>,
    /// Every input sent, in order.
    pub inputs: Vec<String>,
    /// Visible output.
    pub output: String,
    /// Number of interrupts received.
    pub interrupts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, FakeSession>,
    created: Vec<String>,
    killed: Vec<String>,
    failing_kills: HashSet<String>,
    failing_creates: HashSet<String>,
    failing_captures: HashSet<String>,
    capture_delay: Option<Duration>,
}

/// Map-backed session table.
#[derive(Debug, Default)]
pub struct InMemorySessions {
    inner: Mutex<Inner>,
}

impl InMemorySessions {
    /// Empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session as if it had been started outside the supervisor.
    pub async fn insert(&self, name: &str) {
        self.inner
            .lock()
            .await
            .sessions
            .insert(name.to_owned(), FakeSession::default());
    }

    /// Make a session disappear without going through `kill`.
    pub async fn vanish(&self, name: &str) {
        self.inner.lock().await.sessions.remove(name);
    }

    /// Replace a session's visible output.
    pub async fn set_output(&self, name: &str, output: &str) {
        if let Some(session) = self.inner.lock().await.sessions.get_mut(name) {
            output.clone_into(&mut session.output);
        }
    }

    /// Append to a session's visible output.
    pub async fn append_output(&self, name: &str, output: &str) {
        if let Some(session) = self.inner.lock().await.sessions.get_mut(name) {
            session.output.push_str(output);
        }
    }

    /// Make every future `kill` of `name` fail.
    pub async fn fail_kill(&self, name: &str) {
        self.inner.lock().await.failing_kills.insert(name.to_owned());
    }

    /// Make every future `create` of a session whose name ends with
    /// `suffix` fail. Convoy session names embed a generated id, so a
    /// role suffix such as `-security` is enough to target one member.
    pub async fn fail_create(&self, suffix: &str) {
        self.inner
            .lock()
            .await
            .failing_creates
            .insert(suffix.to_owned());
    }

    /// Make every future output capture of `name` fail.
    pub async fn fail_capture(&self, name: &str) {
        self.inner
            .lock()
            .await
            .failing_captures
            .insert(name.to_owned());
    }

    /// Delay every output capture by `delay`.
    pub async fn set_capture_delay(&self, delay: Duration) {
        self.inner.lock().await.capture_delay = Some(delay);
    }

    /// Snapshot of a live session.
    pub async fn session(&self, name: &str) -> Option<FakeSession> {
        self.inner.lock().await.sessions.get(name).cloned()
    }

    /// Inputs sent to `name`; empty if the session is unknown.
    pub async fn inputs(&self, name: &str) -> Vec<String> {
        self.session(name)
            .await
            .map(|s| s.inputs)
            .unwrap_or_default()
    }

    /// Names passed to successful `create` calls, in order.
    pub async fn created(&self) -> Vec<String> {
        self.inner.lock().await.created.clone()
    }

    /// Names passed to successful `kill` calls, in order.
    pub async fn killed(&self) -> Vec<String> {
        self.inner.lock().await.killed.clone()
    }

    /// Names of live sessions.
    pub async fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().await.sessions.keys().cloned().collect();
        names.sort();
        names
    }
}

fn missing(name: &str) -> AppError {
    AppError::ExternalTool(format!("session {name} does not exist"))
}

impl ProcessControl for InMemorySessions {
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move { Ok(self.inner.lock().await.sessions.contains_key(&name)) })
    }

    fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        let session = FakeSession {
            cwd: cwd.to_path_buf(),
            command: command.map(str::to_owned),
            ..FakeSession::default()
        };
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if inner.failing_creates.iter().any(|s| name.ends_with(s.as_str())) {
                return Err(AppError::ExternalTool(format!("cannot create session {name}")));
            }
            if inner.sessions.contains_key(&name) {
                return Err(AppError::ExternalTool(format!("duplicate session: {name}")));
            }
            inner.sessions.insert(name.clone(), session);
            inner.created.push(name);
            Ok(())
        })
    }

    fn send_input(
        &self,
        name: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        let text = text.to_owned();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let session = inner.sessions.get_mut(&name).ok_or_else(|| missing(&name))?;
            session.output.push_str(&text);
            session.output.push('\n');
            session.inputs.push(text);
            Ok(())
        })
    }

    fn interrupt(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let session = inner.sessions.get_mut(&name).ok_or_else(|| missing(&name))?;
            session.interrupts += 1;
            Ok(())
        })
    }

    fn capture_recent_output(
        &self,
        name: &str,
        lines: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            let delay = self.inner.lock().await.capture_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let inner = self.inner.lock().await;
            if inner.failing_captures.contains(&name) {
                return Err(AppError::ExternalTool(format!("cannot read session {name}")));
            }
            let session = inner.sessions.get(&name).ok_or_else(|| missing(&name))?;
            let all: Vec<&str> = session.output.lines().collect();
            let keep = usize::try_from(lines).unwrap_or(usize::MAX).min(all.len());
            Ok(all[all.len() - keep..].join("\n"))
        })
    }

    fn kill(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if inner.failing_kills.contains(&name) {
                return Err(AppError::ExternalTool(format!("cannot kill session {name}")));
            }
            if inner.sessions.remove(&name).is_some() {
                inner.killed.push(name);
            }
            Ok(())
        })
    }
}
