#![forbid(unsafe_code)]

//! Fleet supervisor for autonomous coding agents running in terminal
//! multiplexer sessions.

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod http;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod state;

pub use config::CloisterConfig;
pub use errors::{AppError, Result};
