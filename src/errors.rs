//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested agent, convoy, specialist, or work item does not exist.
    NotFound(String),
    /// Caller supplied an invalid value (specialist name, priority, filter).
    Validation(String),
    /// A process-control call failed or timed out after its retry.
    ExternalTool(String),
    /// Automatic requeue ceiling exceeded for a work item; human reset required.
    CircuitBreaker {
        /// Work item whose circuit is open.
        work_item_id: String,
        /// Counter value after the rejected request.
        auto_requeue_count: u32,
    },
    /// Convoy start referenced an unknown template.
    TemplateNotFound(String),
}

impl AppError {
    /// Stable machine-readable discriminator used in JSON error payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Ipc(_) => "ipc",
            Self::Io(_) => "io",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::ExternalTool(_) => "external_tool",
            Self::CircuitBreaker { .. } => "circuit_open",
            Self::TemplateNotFound(_) => "template_not_found",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::ExternalTool(msg) => write!(f, "external tool: {msg}"),
            Self::CircuitBreaker {
                work_item_id,
                auto_requeue_count,
            } => write!(
                f,
                "circuit open: work item {work_item_id} reached {auto_requeue_count} automatic \
                 requeues; a human must reset it"
            ),
            Self::TemplateNotFound(name) => write!(f, "template not found: {name}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
