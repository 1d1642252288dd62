use std::sync::Arc;

use dashmap::DashMap;
use jobagent_core::{store::Store, JobId, JobStatus, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{context::AgentContext, job::JobController, pool::TaskHandle};

type RunningJobs = Arc<DashMap<JobId, TaskHandle<JobStatus>>>;

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No usable store connection yet.
    Connecting,
    Polling,
    /// The last cycle failed; waiting out the retry interval.
    ErrorBackoff,
}

/// Read-only view of the jobs this agent is running, usable while the engine
/// loop owns the engine.
#[derive(Clone)]
pub struct EngineHandle {
    running: RunningJobs,
}

impl EngineHandle {
    /// Ids of jobs whose controller has not finished, ascending.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .running
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running
            .get(&job_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel a locally running job. Returns `false` when it is not running here.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        match self.running.get(&job_id) {
            Some(handle) if !handle.is_finished() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Control loop: claims due jobs, dispatches their controllers on the worker
/// pool and relays kill-job signals.
pub struct SchedulerEngine {
    ctx: AgentContext,
    store: Option<Box<dyn Store>>,
    running: RunningJobs,
    cleanup_due: bool,
    state: LoopState,
}

impl SchedulerEngine {
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            store: None,
            running: Arc::new(DashMap::new()),
            cleanup_due: true,
            state: LoopState::Connecting,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            running: self.running.clone(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn agent_id(&self) -> &str {
        &self.ctx.agent_id
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`, then cancels every
    /// running job and waits for it to record its status.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            agent_id = %self.ctx.agent_id,
            hostname = %self.ctx.hostname(),
            pool = self.ctx.pool.capacity(),
            "scheduler engine started"
        );

        while !*shutdown.borrow() {
            let pause = match self.run_cycle() {
                Ok(()) => {
                    self.state = LoopState::Polling;
                    self.ctx.config.agent.job_poll_interval()
                }
                Err(e) => {
                    error!(code = e.code(), "scheduler cycle failed: {e}");
                    self.store = None;
                    self.cleanup_due = true;
                    self.state = LoopState::ErrorBackoff;
                    self.ctx.config.agent.connection_retry_interval()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// One pass of the loop: connectivity, heartbeat, kill signals, cleanup
    /// and claiming. Any error aborts the pass.
    pub fn run_cycle(&mut self) -> Result<()> {
        let mut store = match self.store.take() {
            Some(mut store) => {
                if store.is_valid() {
                    store
                } else {
                    warn!("store connection lost, reconnecting");
                    self.reconnect()?
                }
            }
            None => self.reconnect()?,
        };

        self.cycle(store.as_mut())?;
        self.store = Some(store);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<Box<dyn Store>> {
        self.state = LoopState::Connecting;
        self.cleanup_due = true;
        let store = self.ctx.connector.connect()?;
        info!("connected to job store");
        Ok(store)
    }

    fn cycle(&mut self, store: &mut dyn Store) -> Result<()> {
        let agent_id = self.ctx.agent_id.clone();

        if !store.heartbeat(&agent_id)? && !self.cleanup_due {
            warn!(%agent_id, "agent registration vanished, re-registering");
            self.cleanup_due = true;
        }

        for job_id in store.listen_for_cancellation()? {
            self.cancel_job(job_id);
        }

        if self.cleanup_due {
            store.reconcile_crashed_agents()?;
            store.register_agent(&agent_id, self.ctx.hostname())?;
            self.running.retain(|_, handle| !handle.is_finished());
            self.cleanup_due = false;
            debug!(%agent_id, "cleanup complete");
        }

        for job_id in store.claim_due_jobs(&agent_id, self.ctx.hostname())? {
            self.dispatch(store, job_id);
        }
        Ok(())
    }

    fn dispatch(&mut self, store: &mut dyn Store, job_id: JobId) {
        let busy = self
            .running
            .get(&job_id)
            .is_some_and(|handle| !handle.is_finished());
        if busy {
            warn!(job_id, "job is still running on this agent, not starting it again");
            return;
        }

        match JobController::instantiate(self.ctx.clone(), job_id) {
            Ok(controller) => {
                debug!(job_id, "submitting job");
                let handle = self.ctx.pool.spawn_coordinator(controller);
                self.running.insert(job_id, handle);
            }
            Err(e) => {
                error!(job_id, code = e.code(), "could not start job: {e}");
                if let Err(e) = store.release_job_claim(job_id, &self.ctx.agent_id) {
                    error!(job_id, code = e.code(), "could not release job claim: {e}");
                }
            }
        }
    }

    fn cancel_job(&self, job_id: JobId) {
        match self.running.get(&job_id) {
            Some(handle) if !handle.is_finished() => {
                info!(job_id, "kill request received, cancelling job");
                handle.cancel();
            }
            _ => info!(job_id, "kill request for a job not running here, ignored"),
        }
    }

    async fn shutdown(self) {
        info!("scheduler engine shutting down");
        let ids: Vec<JobId> = self.running.iter().map(|entry| *entry.key()).collect();
        let handles: Vec<(JobId, TaskHandle<JobStatus>)> = ids
            .into_iter()
            .filter_map(|id| self.running.remove(&id))
            .collect();

        for (_, handle) in &handles {
            handle.cancel();
        }
        for (job_id, handle) in handles {
            match handle.join().await {
                Ok(status) => debug!(job_id, %status, "job stopped"),
                Err(e) => error!(job_id, "job task failed: {e}"),
            }
        }
    }
}
