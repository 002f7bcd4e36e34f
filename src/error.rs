//! Error types for the orchestration core.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Request {message_id} to {target} timed out after {timeout:?}")]
    RequestTimeout {
        message_id: String,
        target: String,
        timeout: Duration,
    },

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Capacity exceeded: {what} is limited to {limit}")]
    CapacityExceeded { what: String, limit: usize },

    #[error("Remote execution failed on {agent_id}: {message}")]
    RemoteExecution { agent_id: String, message: String },

    #[error("Agent {target} is not registered")]
    Routing { target: String },

    #[error("Request id {0} is already pending")]
    DuplicateRequest(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Git workflow error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Machine-checkable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection(_) => ErrorKind::Connection,
            Self::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            Self::Routing { .. } => ErrorKind::Routing,
            Self::Task(_) => ErrorKind::Task,
            Self::DuplicateRequest(_) | Self::Git(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the failure concerns the transport or the sandbox rather than
    /// the work itself. Transient failures are requeued by the scheduler.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection
                | ErrorKind::RequestTimeout
                | ErrorKind::Provisioning
                | ErrorKind::Routing
        )
    }
}

/// Tag attached to task snapshots and error payloads next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    RequestTimeout,
    Provisioning,
    CapacityExceeded,
    RemoteExecution,
    Routing,
    Task,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::RequestTimeout => "request_timeout",
            Self::Provisioning => "provisioning",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::RemoteExecution => "remote_execution",
            Self::Routing => "routing",
            Self::Task => "task",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Connection lifecycle errors (registration, heartbeat, closed channels).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No registration received within {grace:?}")]
    RegistrationTimeout { grace: Duration },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Agent {agent_id} missed two heartbeat windows")]
    HeartbeatTimeout { agent_id: String },

    #[error("Cannot send to {agent_id}: connection closed")]
    SendOnClosed { agent_id: String },

    #[error("Connection to {agent_id} lost: {reason}")]
    Lost { agent_id: String, reason: String },

    #[error("Handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },
}

/// Sandbox provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Unknown sandbox category: {category}")]
    UnknownCategory { category: String },

    #[error("Sandbox for {category} failed to start: {reason}")]
    Failed { category: String, reason: String },

    #[error("Sandbox for {category} not ready after {timeout:?}")]
    Timeout { category: String, timeout: Duration },

    #[error("Worker {agent_id} did not register within {timeout:?}")]
    RegistrationTimeout { agent_id: String, timeout: Duration },
}

/// Task bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already in state {from}, cannot transition to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
}

/// Branch/PR bookkeeping errors.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("No branch recorded for task {id}")]
    UnknownTask { id: Uuid },

    #[error("Branch for task {id} is {from}, cannot move to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Task {id} is {status}, only completed tasks get a branch")]
    NotCompleted { id: Uuid, status: String },
}
