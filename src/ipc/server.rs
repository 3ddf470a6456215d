//! Local IPC server for `cloister-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the owning component.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "watchdog-status"}
//! {"command": "convoy-start", "template": "code-review", "files": ["src/lib.rs"]}
//! {"command": "convoy-stop", "id": "convoy-1a2b3c4d", "force": true}
//! {"command": "specialists-wake", "specialist": "review-agent", "task": "look at #42"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: convoy convoy-1", "kind": "not_found"}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::diagnostics;
use crate::models::convoy::{ConvoyParams, ConvoyStatus};
use crate::models::specialist::{Priority, QueuePayload, SpecialistType};
use crate::orchestrator::agents;
use crate::state::AppState;
use crate::{AppError, Result};

/// Source tag for work queued from the command line.
const CTL_SOURCE: &str = "ctl";

/// Inbound IPC request from `cloister-ctl`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Entity identifier (convoy id, agent id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Convoy template name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Files handed to a convoy.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Pull request URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    /// Issue identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    /// Project directory for a convoy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Convoy status filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Skip the graceful interrupt on convoy stop.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
    /// Specialist name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialist: Option<String>,
    /// Task message for a wake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Queue priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Queue item source tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Queue item payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<QueuePayload>,
    /// Work item whose requeue counter is reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    /// Runtime session id reported by a specialist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Context size reported with a heartbeat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    /// Completion outcome reported by an agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Transcript directory for `session-health`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Remove critical transcripts.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub fix: bool,
}

impl IpcRequest {
    /// Request carrying only a command verb.
    #[must_use]
    pub fn command(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            ..Self::default()
        }
    }
}

/// Outbound IPC response to `cloister-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error discriminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl IpcResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    fn failure(err: &AppError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind().to_owned()),
        }
    }
}

impl From<Result<Value>> for IpcResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<AppState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::failure(&AppError::Validation(format!(
                            "invalid json: {err}"
                        ))),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed","kind":"ipc"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the owning component.
pub async fn dispatch_command(request: &IpcRequest, state: &Arc<AppState>) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    let result = route(request, state).instrument(span).await;
    if let Err(ref err) = result {
        warn!(command = %request.command, %err, "ipc command failed");
    }
    result.into()
}

async fn route(request: &IpcRequest, state: &Arc<AppState>) -> Result<Value> {
    match request.command.as_str() {
        "watchdog-status" => to_data(&state.monitor.get_status().await?),
        "watchdog-start" => {
            let started = state.monitor.start().await;
            Ok(serde_json::json!({ "running": true, "started": started }))
        }
        "watchdog-stop" => {
            let stopped = state.monitor.stop().await;
            Ok(serde_json::json!({ "running": false, "stopped": stopped }))
        }
        "emergency-stop" => to_data(&state.monitor.emergency_stop().await?),
        "templates" => to_data(&state.convoys.templates()),
        "convoy-start" => handle_convoy_start(request, state).await,
        "convoy-status" => handle_convoy_status(request, state).await,
        "convoy-list" => {
            let filter = request
                .status
                .as_deref()
                .map(str::parse::<ConvoyStatus>)
                .transpose()?;
            to_data(&state.convoys.list(filter).await?)
        }
        "convoy-stop" => {
            let id = required(request.id.as_deref(), "id")?;
            to_data(&state.convoys.stop(id, request.force).await?)
        }
        "specialists-list" => to_data(&state.specialists.list_specialists().await?),
        "specialists-queue" => {
            let specialist = specialist_of(request)?;
            to_data(&state.specialists.peek_queue(specialist).await?)
        }
        "specialists-wake" => {
            let specialist = specialist_of(request)?;
            to_data(
                &state
                    .specialists
                    .wake(specialist, request.task.as_deref())
                    .await?,
            )
        }
        "specialists-reset" => {
            let work_item_id = required(request.work_item_id.as_deref(), "work_item_id")?;
            state.specialists.reset_requeue(work_item_id).await?;
            Ok(serde_json::json!({ "work_item_id": work_item_id, "reset": true }))
        }
        "dispatch" => {
            let specialist = specialist_of(request)?;
            to_data(&state.specialists.dispatch_next(specialist).await?)
        }
        "enqueue" => handle_enqueue(request, state).await,
        "record-session" => {
            let specialist = specialist_of(request)?;
            let session_id = required(request.session_id.as_deref(), "session_id")?;
            to_data(
                &state
                    .specialists
                    .record_session_id(specialist, session_id)
                    .await?,
            )
        }
        "heartbeat" => {
            let id = required(request.id.as_deref(), "id")?;
            to_data(&agents::record_heartbeat(&state.agents, id, request.context_tokens).await?)
        }
        "agent-done" => {
            let id = required(request.id.as_deref(), "id")?;
            let success = request.success.unwrap_or(true);
            to_data(&agents::report_completion(&state.agents, id, success).await?)
        }
        "session-health" => handle_session_health(request).await,
        other => Err(AppError::Validation(format!("unknown command: {other}"))),
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| AppError::Ipc(format!("serialization failed: {err}")))
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::Validation(format!("missing required '{field}' field")))
}

fn specialist_of(request: &IpcRequest) -> Result<SpecialistType> {
    required(request.specialist.as_deref(), "specialist")?.parse()
}

async fn handle_convoy_start(request: &IpcRequest, state: &Arc<AppState>) -> Result<Value> {
    let template = required(request.template.as_deref(), "template")?;
    let params = ConvoyParams {
        files: request.files.clone(),
        pr_url: request.pr_url.clone(),
        issue_id: request.issue_id.clone(),
        project_path: request.project_path.clone(),
    };
    to_data(&state.convoys.start(template, params).await?)
}

/// With an id, one convoy; without, every convoy still running.
async fn handle_convoy_status(request: &IpcRequest, state: &Arc<AppState>) -> Result<Value> {
    match request.id.as_deref() {
        Some(id) => to_data(&state.convoys.status(id).await?),
        None => to_data(&state.convoys.list(Some(ConvoyStatus::Running)).await?),
    }
}

async fn handle_enqueue(request: &IpcRequest, state: &Arc<AppState>) -> Result<Value> {
    let specialist = specialist_of(request)?;
    let priority = request
        .priority
        .as_deref()
        .map(str::parse::<Priority>)
        .transpose()?
        .unwrap_or_default();
    let source = request.source.as_deref().unwrap_or(CTL_SOURCE);
    let payload = request.payload.clone().unwrap_or_default();
    to_data(
        &state
            .specialists
            .enqueue(specialist, priority, source, payload)
            .await?,
    )
}

async fn handle_session_health(request: &IpcRequest) -> Result<Value> {
    let base = request
        .path
        .clone()
        .or_else(diagnostics::default_transcript_root)
        .ok_or_else(|| AppError::Validation("no transcript path given and HOME unset".into()))?;
    let fix = request.fix;
    let report = tokio::task::spawn_blocking(move || diagnostics::check_sessions(&base, fix))
        .await
        .map_err(|err| AppError::Io(format!("session health task failed: {err}")))??;
    to_data(&report)
}
