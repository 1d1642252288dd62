//! Job definition and log inspection on top of [`SqliteStore`].
//!
//! The agent itself only claims and logs; these helpers are what an operator
//! tool (or a test) uses to put jobs into the store and read results back.

use chrono::{DateTime, Utc};
use jobagent_core::types::{
    JobId, JobLogId, OnError, RunStatus, StepId, StepKind, StepStatus, StoreCode,
};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use crate::{
    db::{now, timestamp},
    error::{Result, StoreError},
    schedule::{compute_next_run, Schedule},
    sqlite::SqliteStore,
};

/// A job to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Station the job is pinned to; empty runs on any agent.
    pub host_agent: String,
    pub schedule: Option<Schedule>,
    /// First run. Defaults to the schedule's next run after now.
    pub next_run: Option<DateTime<Utc>>,
}

impl NewJob {
    /// An enabled, unpinned job due immediately.
    pub fn due_now(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            host_agent: String::new(),
            schedule: None,
            next_run: Some(Utc::now()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A step to insert.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub kind: StepKind,
    pub code: String,
    pub connection_string: String,
    pub database_name: String,
    pub on_error: OnError,
}

impl NewStep {
    pub fn sql(name: impl Into<String>, database: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            kind: StepKind::Sql,
            code: code.into(),
            connection_string: String::new(),
            database_name: database.into(),
            on_error: OnError::Fail,
        }
    }

    pub fn batch(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            kind: StepKind::Batch,
            code: script.into(),
            connection_string: String::new(),
            database_name: String::new(),
            on_error: OnError::Fail,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }
}

/// A job log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogEntry {
    pub id: JobLogId,
    pub job_id: JobId,
    pub status: RunStatus,
    pub duration_ms: Option<i64>,
}

/// A step log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLogEntry {
    pub step_id: StepId,
    pub status: StepStatus,
    pub result: Option<i64>,
    pub output: Option<String>,
}

/// Claim state of a job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobClaim {
    pub agent_id: Option<String>,
    pub next_run: Option<String>,
}

impl SqliteStore {
    pub fn add_job(&self, job: &NewJob) -> Result<JobId> {
        let schedule_json = job
            .schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::InvalidSchedule(e.to_string()))?;
        let next_run = job
            .next_run
            .or_else(|| {
                job.schedule
                    .as_ref()
                    .and_then(|s| compute_next_run(s, Utc::now()))
            })
            .map(timestamp);

        self.connection().execute(
            "INSERT INTO job (name, description, enabled, host_agent, schedule, next_run, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.name,
                job.description,
                job.enabled,
                job.host_agent,
                schedule_json,
                next_run,
                now()
            ],
        )?;
        let id = self.connection().last_insert_rowid();
        info!(job_id = id, name = %job.name, "job added");
        Ok(id)
    }

    pub fn add_step(&self, job_id: JobId, step: &NewStep) -> Result<StepId> {
        self.connection().execute(
            "INSERT INTO job_step
             (job_id, name, description, enabled, kind, code, connection_string, database_name, on_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job_id,
                step.name,
                step.description,
                step.enabled,
                step.kind.code(),
                step.code,
                step.connection_string,
                step.database_name,
                step.on_error.code()
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    /// Make a job due at `at` (or never, with `None`).
    pub fn set_next_run(&self, job_id: JobId, at: Option<DateTime<Utc>>) -> Result<()> {
        let n = self.connection().execute(
            "UPDATE job SET next_run = ?1 WHERE id = ?2",
            params![at.map(timestamp), job_id],
        )?;
        if n == 0 {
            return Err(StoreError::JobNotFound { id: job_id });
        }
        Ok(())
    }

    pub fn job_claim(&self, job_id: JobId) -> Result<JobClaim> {
        self.connection()
            .query_row(
                "SELECT agent_id, next_run FROM job WHERE id = ?1",
                [job_id],
                |row| {
                    Ok(JobClaim {
                        agent_id: row.get(0)?,
                        next_run: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::JobNotFound { id: job_id })
    }

    /// Most recent log entry of a job.
    pub fn latest_job_log(&self, job_id: JobId) -> Result<Option<JobLogEntry>> {
        let row: Option<(JobLogId, String, Option<i64>)> = self
            .connection()
            .query_row(
                "SELECT id, status, duration_ms FROM job_log
                 WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                [job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((id, status, duration_ms)) => Ok(Some(JobLogEntry {
                id,
                job_id,
                status: RunStatus::parse_code(&status)?,
                duration_ms,
            })),
            None => Ok(None),
        }
    }

    /// Step log entries of one job run, in insertion order.
    pub fn step_logs(&self, job_log_id: JobLogId) -> Result<Vec<StepLogEntry>> {
        let mut stmt = self.connection().prepare(
            "SELECT step_id, status, result, output FROM job_step_log
             WHERE job_log_id = ?1 ORDER BY id",
        )?;
        let rows: Vec<(StepId, String, Option<i64>, Option<String>)> = stmt
            .query_map([job_log_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (step_id, status, result, output) in rows {
            entries.push(StepLogEntry {
                step_id,
                status: RunStatus::parse_code(&status)?,
                result,
                output,
            });
        }
        Ok(entries)
    }
}
