//! Shared fixtures: a daemon state over an in-memory database and the
//! in-memory process adapter.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use cloister::config::CloisterConfig;
use cloister::models::agent::{AgentRecord, RuntimeKind};
use cloister::persistence::db;
use cloister::process::memory::InMemorySessions;
use cloister::process::{agent_session_name, ProcessControl};
use cloister::state::AppState;
use cloister::Result;

pub struct Harness {
    pub state: Arc<AppState>,
    pub sessions: Arc<InMemorySessions>,
    pub dir: TempDir,
}

/// Configuration rooted in `dir` with the monitor left stopped.
pub fn test_config(dir: &TempDir) -> CloisterConfig {
    let raw = format!(
        r#"
state_dir = '{}'
tick_interval_seconds = 3600

[startup]
auto_start = false

[process]
command_timeout_seconds = 2
poke_message = "ping from supervisor"
"#,
        dir.path().display()
    );
    CloisterConfig::from_toml_str(&raw).expect("test config")
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut CloisterConfig)) -> Self {
        Self::build(adjust, |sessions| sessions as Arc<dyn ProcessControl>).await
    }

    /// Harness whose daemon talks to the in-memory sessions through `wrap`.
    pub async fn with_process(
        wrap: impl FnOnce(Arc<InMemorySessions>) -> Arc<dyn ProcessControl>,
    ) -> Self {
        Self::build(|_| {}, wrap).await
    }

    async fn build(
        adjust: impl FnOnce(&mut CloisterConfig),
        wrap: impl FnOnce(Arc<InMemorySessions>) -> Arc<dyn ProcessControl>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(&dir);
        adjust(&mut config);

        let db = Arc::new(db::connect_memory().await.expect("db"));
        let sessions = Arc::new(InMemorySessions::new());
        let process = wrap(sessions.clone());
        let state = Arc::new(AppState::new(Arc::new(config), db, process));

        Self {
            state,
            sessions,
            dir,
        }
    }

    /// Register a live agent whose last heartbeat was `minutes_ago`
    /// minutes in the past, with a running session that shows `output`.
    pub async fn agent(&self, id: &str, minutes_ago: i64, output: &str) -> AgentRecord {
        let session = agent_session_name(id);
        self.sessions.insert(&session).await;
        self.sessions.set_output(&session, output).await;

        let mut record = AgentRecord::new(
            id.to_owned(),
            RuntimeKind::NativeAnthropic,
            session,
            self.dir.path().to_string_lossy().into_owned(),
            None,
        );
        record.last_heartbeat = Utc::now() - Duration::minutes(minutes_ago);
        self.state.agents.create(&record).await.expect("agent")
    }
}

/// In-memory sessions whose `create` and `interrupt` calls take a while.
pub struct SlowSessions {
    pub inner: Arc<InMemorySessions>,
    pub create_delay: std::time::Duration,
    pub interrupt_delay: std::time::Duration,
}

impl SlowSessions {
    pub fn wrap(
        inner: Arc<InMemorySessions>,
        create_delay: std::time::Duration,
        interrupt_delay: std::time::Duration,
    ) -> Arc<dyn ProcessControl> {
        Arc::new(Self {
            inner,
            create_delay,
            interrupt_delay,
        })
    }
}

impl ProcessControl for SlowSessions {
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        self.inner.exists(name)
    }

    fn create(
        &self,
        name: &str,
        cwd: &Path,
        command: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        let cwd = cwd.to_path_buf();
        let command = command.map(str::to_owned);
        Box::pin(async move {
            tokio::time::sleep(self.create_delay).await;
            self.inner.create(&name, &cwd, command.as_deref()).await
        })
    }

    fn send_input(
        &self,
        name: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.inner.send_input(name, text)
    }

    fn interrupt(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            tokio::time::sleep(self.interrupt_delay).await;
            self.inner.interrupt(&name).await
        })
    }

    fn capture_recent_output(
        &self,
        name: &str,
        lines: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        self.inner.capture_recent_output(name, lines)
    }

    fn kill(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.inner.kill(name)
    }
}
