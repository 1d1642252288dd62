use thiserror::Error;

use crate::types::JobId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Store connection is not available")]
    NotConnected,

    #[error("Unknown {kind} code: {code:?}")]
    UnknownCode { kind: &'static str, code: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error(
        "Remote connection types are not supported. \
         Use annotations to point a step at another host or database."
    )]
    RemoteConnection,

    #[error("Unknown database host: {host}")]
    UnknownHost { host: String },

    #[error("Statement cancelled")]
    Cancelled,

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short error code used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "CONFIG_ERROR",
            AgentError::Database(_) => "DATABASE_ERROR",
            AgentError::NotConnected => "NOT_CONNECTED",
            AgentError::UnknownCode { .. } => "UNKNOWN_CODE",
            AgentError::JobNotFound { .. } => "JOB_NOT_FOUND",
            AgentError::RemoteConnection => "REMOTE_CONNECTION",
            AgentError::UnknownHost { .. } => "UNKNOWN_HOST",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Mail(_) => "MAIL_ERROR",
            AgentError::Serialization(_) => "SERIALIZATION_ERROR",
            AgentError::Io(_) => "IO_ERROR",
            AgentError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
