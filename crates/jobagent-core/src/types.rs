//! Shared domain types: identifiers, status enumerations and the records the
//! store hands to the engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub type JobId = i64;
pub type StepId = i64;
pub type JobLogId = i64;
pub type StepLogId = i64;

// ---------------------------------------------------------------------------
// Store codes
// ---------------------------------------------------------------------------

/// An enumeration persisted in the store as a one-letter code.
///
/// `code` is an exhaustive match; `from_code` searches `ALL`, so the two
/// directions cannot drift apart as long as `ALL` lists every variant.
pub trait StoreCode: Sized + Copy + 'static {
    /// Human-readable name used in error messages.
    const KIND: &'static str;
    const ALL: &'static [Self];

    fn code(&self) -> &'static str;

    fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.code() == code)
    }

    /// Like `from_code` but reports the unknown code as an [`AgentError`].
    fn parse_code(code: &str) -> Result<Self> {
        Self::from_code(code).ok_or_else(|| AgentError::UnknownCode {
            kind: Self::KIND,
            code: code.to_string(),
        })
    }
}

/// Outcome of a job or a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Fail,
    Succeed,
    /// Cancelled or timed out.
    Aborted,
    /// Job: there was nothing to run. Step: the error was ignored by policy.
    Ignore,
}

pub type JobStatus = RunStatus;
pub type StepStatus = RunStatus;

impl StoreCode for RunStatus {
    const KIND: &'static str = "status";
    const ALL: &'static [Self] = &[
        RunStatus::Running,
        RunStatus::Fail,
        RunStatus::Succeed,
        RunStatus::Aborted,
        RunStatus::Ignore,
    ];

    fn code(&self) -> &'static str {
        match self {
            RunStatus::Running => "r",
            RunStatus::Fail => "f",
            RunStatus::Succeed => "s",
            RunStatus::Aborted => "d",
            RunStatus::Ignore => "i",
        }
    }
}

impl RunStatus {
    /// Upper-case name, the form substituted into e-mail templates.
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Fail => "FAIL",
            RunStatus::Succeed => "SUCCEED",
            RunStatus::Aborted => "ABORTED",
            RunStatus::Ignore => "IGNORE",
        }
    }

    /// Case-insensitive lookup by name (`fail`, `SUCCEED`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a failing step resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnError {
    Fail,
    Succeed,
    Ignore,
}

impl StoreCode for OnError {
    const KIND: &'static str = "on-error policy";
    const ALL: &'static [Self] = &[OnError::Fail, OnError::Succeed, OnError::Ignore];

    fn code(&self) -> &'static str {
        match self {
            OnError::Fail => "f",
            OnError::Succeed => "s",
            OnError::Ignore => "i",
        }
    }
}

impl OnError {
    /// Status a failed step ends with under this policy.
    pub fn failure_status(&self) -> StepStatus {
        match self {
            OnError::Fail => RunStatus::Fail,
            OnError::Succeed => RunStatus::Succeed,
            OnError::Ignore => RunStatus::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Sql,
    Batch,
}

impl StoreCode for StepKind {
    const KIND: &'static str = "step kind";
    const ALL: &'static [Self] = &[StepKind::Sql, StepKind::Batch];

    fn code(&self) -> &'static str {
        match self {
            StepKind::Sql => "s",
            StepKind::Batch => "b",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A job as loaded by its controller.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    /// Free text; may carry `@KEY=value;` annotations.
    pub description: String,
}

/// One enabled step of a job, in store order.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub job_id: JobId,
    pub id: StepId,
    pub name: String,
    pub description: String,
    pub kind: StepKind,
    /// SQL text or script body.
    pub code: String,
    /// Legacy remote connection string. Must be empty.
    pub connection_string: String,
    pub database_name: String,
    pub on_error: OnError,
}

/// Final values written to a step log entry.
#[derive(Debug, Clone)]
pub struct StepLogUpdate {
    pub status: StepStatus,
    pub result: i64,
    pub output: String,
    pub duration: Duration,
}

/// Database login. Either half may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credential {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credential {
    pub fn new(user: Option<String>, password: Option<String>) -> Self {
        Self { user, password }
    }
}

/// Where a SQL step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTarget {
    pub host: String,
    pub database: String,
    pub credential: Credential,
}

/// Counts reported by a crashed-agent reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub dead_agents: usize,
    pub aborted_jobs: usize,
    pub aborted_steps: usize,
    pub released_jobs: usize,
}
