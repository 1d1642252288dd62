use jobagent_core::{types::JobId, AgentError};
use thiserror::Error;

/// Errors raised by the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The stored schedule definition could not be decoded or encoded.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown store codes and other failures shared with the rest of the agent.
    #[error(transparent)]
    Core(#[from] AgentError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for AgentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound { id } => AgentError::JobNotFound { id },
            StoreError::Io(e) => AgentError::Io(e),
            StoreError::Core(e) => e,
            other => AgentError::Database(other.to_string()),
        }
    }
}
