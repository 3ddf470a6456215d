//! HTTP boundary.
//!
//! Routes:
//! - `GET  /health` liveness probe, body `ok`.
//! - `GET  /status` watchdog status.
//! - `POST /workspaces/{issue_id}/request-review` re-review request,
//!   subject to the requeue circuit breaker (`429` once open).
//! - `POST /agents/{agent_id}/heartbeat` heartbeat from a running agent,
//!   answered with the rotation verdict.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::agents;
use crate::state::AppState;
use crate::{AppError, Result};

/// Optional body of a re-review request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRequestBody {
    #[serde(default)]
    message: Option<String>,
}

/// Successful re-review response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewQueued {
    /// Human-readable summary.
    pub message: String,
    /// Always `true`.
    pub queued: bool,
    /// Automatic requeues still allowed.
    pub remaining_requeues: u32,
}

/// Circuit-open response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRejected {
    /// Human-readable reason.
    pub error: String,
    /// Counter value after the rejected request.
    pub auto_requeue_count: u32,
}

/// Optional body of a heartbeat.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct HeartbeatBody {
    #[serde(default)]
    context_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) | Self::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::CircuitBreaker { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| AppError::Validation(format!("invalid body: {err}")))
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.get_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn request_review(
    State(state): State<Arc<AppState>>,
    Path(issue_id): Path<String>,
    body: Bytes,
) -> Response {
    let body: ReviewRequestBody = match parse_body(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };

    match state.specialists.request_review(&issue_id, body.message).await {
        Ok(receipt) => {
            info!(issue_id, remaining = receipt.remaining_requeues, "re-review queued");
            Json(ReviewQueued {
                message: format!("review of {issue_id} queued for the review specialist"),
                queued: true,
                remaining_requeues: receipt.remaining_requeues,
            })
            .into_response()
        }
        Err(
            err @ AppError::CircuitBreaker {
                auto_requeue_count, ..
            },
        ) => {
            warn!(issue_id, auto_requeue_count, "re-review rejected; circuit open");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ReviewRejected {
                    error: err.to_string(),
                    auto_requeue_count,
                }),
            )
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Response {
    let body: HeartbeatBody = match parse_body(&body) {
        Ok(body) => body,
        Err(err) => return err.into_response(),
    };
    match agents::record_heartbeat(&state.agents, &agent_id, body.context_tokens).await {
        Ok(ack) => Json(ack).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/workspaces/{issue_id}/request-review", post(request_review))
        .route("/agents/{agent_id}/heartbeat", post(heartbeat))
        .with_state(state)
}

/// Serve on an already bound listener until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;
    info!("http server shut down");
    Ok(())
}

/// Bind `127.0.0.1:http_port` and serve until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the port cannot be bound or the server fails.
pub async fn serve_http(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Io(format!("failed to bind http on {bind}: {err}")))?;
    info!(%bind, "http server listening");
    serve_on(listener, state, ct).await
}
