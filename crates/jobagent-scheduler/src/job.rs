use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobagent_core::{
    annotation::JobOverrides,
    store::Store,
    types::{JobLogId, JobRecord, StepId, StepRecord},
    JobId, JobStatus, OnError, Result, RunStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    context::AgentContext,
    pool::{CancellableTask, TaskHandle},
    step::{StepExecutor, StepOutcome},
};

/// Drives one run of one job: sequences its steps, enforces the job timeout
/// and writes the final status.
pub struct JobController {
    ctx: AgentContext,
    store: Box<dyn Store>,
    job: JobRecord,
    overrides: JobOverrides,
    log_id: JobLogId,
    steps: Vec<StepRecord>,
    started: Instant,
}

impl JobController {
    /// Load the job and its enabled steps and open a RUNNING job log entry.
    pub fn instantiate(ctx: AgentContext, job_id: JobId) -> Result<Self> {
        let mut store = ctx.connector.connect()?;
        let job = store.load_job(job_id)?;
        let overrides = JobOverrides::from_description(&job.description);
        let started = Instant::now();
        let log_id = store.create_job_log(job_id)?;

        let steps = match store.load_enabled_steps(job_id) {
            Ok(steps) => steps,
            Err(e) => {
                // Do not leave the log entry RUNNING.
                if let Err(update) = store.update_job_log(log_id, RunStatus::Fail, started.elapsed()) {
                    error!(job_id, "could not close job log: {update}");
                }
                return Err(e);
            }
        };

        Ok(Self {
            ctx,
            store,
            job,
            overrides,
            log_id,
            steps,
            started,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.overrides.timeout
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    fn finalize(&mut self, status: JobStatus) {
        let duration = self.started.elapsed();
        if let Err(e) = self.store.update_job_log(self.log_id, status, duration) {
            error!(job_id = self.job.id, code = e.code(), "could not write job status: {e}");
        }
        if let Err(e) = self.store.release_job_claim(self.job.id, &self.ctx.agent_id) {
            error!(job_id = self.job.id, code = e.code(), "could not release job claim: {e}");
        }
        info!(
            job_id = self.job.id,
            name = %self.job.name,
            %status,
            duration_ms = duration.as_millis() as u64,
            "job finished"
        );
    }
}

/// A dispatched step, with what is needed to account for it if its task dies.
struct RunningStep {
    step_id: StepId,
    on_error: OnError,
    handle: TaskHandle<StepOutcome>,
}

type Outstanding = Vec<RunningStep>;

#[async_trait]
impl CancellableTask for JobController {
    type Output = JobStatus;

    fn name(&self) -> String {
        format!("job {} ({})", self.job.id, self.job.name)
    }

    async fn run(mut self, cancel: CancellationToken) -> JobStatus {
        let job_id = self.job.id;
        let steps = std::mem::take(&mut self.steps);
        let step_count = steps.len();
        let watch = Watch {
            job_id,
            poll: self.ctx.config.agent.job_poll_check(),
            deadline: self.overrides.timeout.map(|t| self.started + t),
            cancel: cancel.clone(),
        };
        info!(job_id, name = %self.job.name, steps = step_count, "job started");

        let mut outstanding: Outstanding = Vec::new();
        let mut finished: Vec<StepOutcome> = Vec::new();
        let mut aborted = false;

        for record in steps {
            let executor =
                StepExecutor::new(self.ctx.clone(), self.log_id, self.job.name.clone(), record);
            if !executor.runs_in_parallel() && !watch.await_all(&mut outstanding, &mut finished).await {
                aborted = true;
                break;
            }
            let step_id = executor.step_id();
            let on_error = executor.on_error();
            debug!(job_id, step_id, "dispatching step");
            let handle = self.ctx.pool.submit_with_token(executor, cancel.child_token());
            outstanding.push(RunningStep {
                step_id,
                on_error,
                handle,
            });
        }
        if !aborted && !watch.await_all(&mut outstanding, &mut finished).await {
            aborted = true;
        }

        if aborted {
            for step in &outstanding {
                step.handle.cancel();
            }
            // Cancelled steps still record their own final status.
            for step in outstanding.drain(..) {
                finished.push(settle(job_id, step).await);
            }
        }

        let status = resolve_job_status(aborted, step_count, &finished);
        self.finalize(status);
        status
    }
}

/// Polling state shared by every barrier of one job run.
struct Watch {
    job_id: JobId,
    poll: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Watch {
    /// Wait for every outstanding step. Returns `false` once the job has timed
    /// out or been cancelled, leaving any unfinished handles in place.
    async fn await_all(&self, outstanding: &mut Outstanding, finished: &mut Vec<StepOutcome>) -> bool {
        loop {
            let mut i = 0;
            while i < outstanding.len() {
                if outstanding[i].handle.is_finished() {
                    let step = outstanding.remove(i);
                    finished.push(settle(self.job_id, step).await);
                } else {
                    i += 1;
                }
            }

            if self.cancel.is_cancelled() {
                info!(job_id = self.job_id, "job cancelled");
                return false;
            }
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(job_id = self.job_id, "job timed out");
                return false;
            }
            if outstanding.is_empty() {
                return true;
            }

            outstanding[0].handle.wait_for(self.poll).await;
        }
    }
}

/// Join a finished (or cancelled) step. A step task that died counts as a
/// failure of that step under its own on-error policy.
async fn settle(job_id: JobId, step: RunningStep) -> StepOutcome {
    let name = step.handle.name().to_string();
    match step.handle.join().await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id, step_id = step.step_id, step = %name, "step task failed: {e}");
            StepOutcome {
                step_id: step.step_id,
                on_error: step.on_error,
                status: step.on_error.failure_status(),
                result: -1,
                output: e.to_string(),
            }
        }
    }
}

/// First match wins: ABORTED, IGNORE when there was nothing to run, FAIL when
/// a FAIL-policy step failed, SUCCEED.
pub fn resolve_job_status(aborted: bool, step_count: usize, outcomes: &[StepOutcome]) -> JobStatus {
    if aborted {
        RunStatus::Aborted
    } else if step_count == 0 {
        RunStatus::Ignore
    } else if outcomes
        .iter()
        .any(|o| o.status == RunStatus::Fail && o.on_error == OnError::Fail)
    {
        RunStatus::Fail
    } else {
        RunStatus::Succeed
    }
}
