//! `jobagent-core`: configuration, errors, domain types and the annotation
//! parser shared by every jobagent crate, plus the traits the engine uses to
//! reach the store and the mailer.

pub mod annotation;
pub mod config;
pub mod error;
pub mod mail;
pub mod store;
pub mod types;

pub use config::JobAgentConfig;
pub use error::{AgentError, Result};
pub use types::{JobId, JobStatus, OnError, RunStatus, StepKind, StepStatus, StoreCode};
