#![forbid(unsafe_code)]

//! `cloister` supervisor daemon.
//!
//! Bootstraps configuration and the database, resumes health monitoring
//! of agents recorded by a previous run, and serves the IPC socket for
//! `cloister-ctl` and the HTTP boundary for agents.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use cloister::config::CloisterConfig;
use cloister::http;
use cloister::ipc::server::spawn_ipc_server;
use cloister::persistence::{db, retention};
use cloister::process::tmux::TmuxSessions;
use cloister::process::ProcessControl;
use cloister::state::AppState;
use cloister::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "cloister", about = "Coding agent fleet supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "cloister.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Do not start the health monitor even if `startup.auto_start` is set.
    #[arg(long)]
    no_watchdog: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("cloister supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = Arc::new(CloisterConfig::load_from_path(&args.config)?);
    info!(config = %args.config.display(), "configuration loaded");

    let db = Arc::new(db::connect(&config.db_path()).await?);
    info!(path = %config.db_path().display(), "database connected");

    let process: Arc<dyn ProcessControl> = Arc::new(TmuxSessions::from_config(&config.process));
    let state = Arc::new(AppState::new(Arc::clone(&config), db, process));

    recover_on_startup(&state).await;

    if config.startup.auto_start && !args.no_watchdog {
        state.monitor.start().await;
    } else {
        info!("health monitor not started; use `cloister-ctl watchdog start`");
    }

    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&state.db), config.retention_days, ct.clone());
    info!("retention service started");

    let ipc_handle = spawn_ipc_server(Arc::clone(&state), ct.clone())?;

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve_http(http_state, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!("cloister ready");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // Agents outlive the supervisor; only the scheduler stops.
    state.monitor.stop().await;

    let _ = tokio::join!(ipc_handle, http_handle, retention_handle);
    info!("cloister shut down");

    Ok(())
}

/// Log the agents a previous run left alive. Monitoring picks them up
/// from their persisted heartbeat on the first tick.
async fn recover_on_startup(state: &AppState) {
    async {
        match state.agents.list_live().await {
            Ok(live) if live.is_empty() => info!("no live agents found on startup"),
            Ok(live) => {
                for agent in &live {
                    info!(
                        agent_id = %agent.id,
                        session = %agent.session_handle,
                        health = agent.health.as_str(),
                        last_heartbeat = %agent.last_heartbeat,
                        "resuming supervision of agent"
                    );
                }
                info!(count = live.len(), "live agents recovered from registry");
            }
            Err(err) => warn!(%err, "failed to read agent registry on startup"),
        }
    }
    .instrument(info_span!("startup_recovery"))
    .await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
