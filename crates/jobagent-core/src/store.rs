//! Interfaces to the shared relational store and to target databases.
//!
//! The engine never talks to a database driver directly. The scheduler loop,
//! every job controller and every step each open their own [`Store`] through a
//! [`StoreConnector`], so no connection is shared between tasks.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{
    Credential, JobId, JobLogId, JobRecord, JobStatus, ReconcileReport, SqlTarget, StepId,
    StepLogId, StepLogUpdate, StepRecord,
};

/// One connection to the job store.
pub trait Store: Send {
    /// Cheap liveness probe.
    fn is_valid(&mut self) -> bool;

    /// Atomically mark enabled, unclaimed, due jobs whose host affinity is
    /// empty or `hostname` as claimed by `agent_id`, returning their ids.
    fn claim_due_jobs(&mut self, agent_id: &str, hostname: &str) -> Result<Vec<JobId>>;

    fn load_job(&mut self, job_id: JobId) -> Result<JobRecord>;

    /// Enabled steps ordered by (name, id).
    fn load_enabled_steps(&mut self, job_id: JobId) -> Result<Vec<StepRecord>>;

    /// Insert a RUNNING job log entry.
    fn create_job_log(&mut self, job_id: JobId) -> Result<JobLogId>;

    fn update_job_log(&mut self, log_id: JobLogId, status: JobStatus, duration: Duration)
        -> Result<()>;

    /// Insert a RUNNING step log entry.
    fn create_step_log(&mut self, job_log_id: JobLogId, step_id: StepId) -> Result<StepLogId>;

    fn update_step_log(&mut self, step_log_id: StepLogId, update: &StepLogUpdate) -> Result<()>;

    /// Abort the running logs of agents that stopped heart-beating, release
    /// their claims and delete their registrations.
    fn reconcile_crashed_agents(&mut self) -> Result<ReconcileReport>;

    /// Idempotent upsert of this agent's registration.
    fn register_agent(&mut self, agent_id: &str, hostname: &str) -> Result<()>;

    /// Refresh the registration's liveness. Returns `false` when the
    /// registration no longer exists (another agent reaped it).
    fn heartbeat(&mut self, agent_id: &str) -> Result<bool>;

    /// Clear `agent_id`'s claim on the job and recompute its next run. A
    /// claim now held by another agent is left alone.
    fn release_job_claim(&mut self, job_id: JobId, agent_id: &str) -> Result<()>;

    /// Non-blocking drain of kill-job signals published since the last call.
    fn listen_for_cancellation(&mut self) -> Result<Vec<JobId>>;

    /// Publish a kill-job signal for every listening agent.
    fn notify_kill_job(&mut self, job_id: JobId) -> Result<()>;
}

/// Interrupts whatever statement its session is running.
pub trait StatementCanceller: Send + Sync {
    fn cancel(&self);
}

/// A connection to a step's target database.
pub trait TargetSession: Send {
    fn canceller(&self) -> Arc<dyn StatementCanceller>;

    /// Run one or more statements, discarding results.
    fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run `sql` and read each row's first two columns as user and password.
    fn query_credentials(&mut self, sql: &str) -> Result<Vec<Credential>>;
}

/// Opens store and target connections.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Store>>;

    fn connect_target(&self, target: &SqlTarget) -> Result<Box<dyn TargetSession>>;
}
