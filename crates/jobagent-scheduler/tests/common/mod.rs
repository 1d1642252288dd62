#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobagent_core::{mail::Mailer, JobAgentConfig, JobId, JobStatus, Result};
use jobagent_scheduler::{AgentContext, JobController, TaskHandle};
use jobagent_store::{JobLogEntry, NewJob, NewStep, SqliteConnector, SqliteStore, StepLogEntry};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, to: &[String], subject: &str, body: &str) -> Result<()> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// A throwaway data directory with an agent store and helpers to run jobs.
pub struct Harness {
    pub dir: TempDir,
    pub config: JobAgentConfig,
    pub connector: Arc<SqliteConnector>,
    pub mailer: Arc<RecordingMailer>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobAgentConfig::default();
        config.database.data_dir = dir.path().to_path_buf();
        config.database.name = "agent".to_string();
        config.database.user = Some("agent".to_string());
        config.agent.hostname = "test-host".to_string();
        config.agent.job_poll_interval_ms = 50;
        config.agent.connection_retry_interval_ms = 50;
        config.agent.job_poll_check_ms = 20;
        config.agent.worker_pool_size = 8;
        let connector = Arc::new(SqliteConnector::new(&config));
        Self {
            dir,
            config,
            connector,
            mailer: Arc::new(RecordingMailer::default()),
        }
    }

    /// A fresh agent identity sharing this harness's store and mailer.
    pub fn context(&self) -> AgentContext {
        AgentContext::new(self.config.clone(), self.connector.clone(), self.mailer.clone())
    }

    pub fn store(&self) -> SqliteStore {
        self.connector.open_store().unwrap()
    }

    /// Create a target database holding one `seed` table.
    pub fn create_database(&self, name: &str) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(self.connector.database_path(name)).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS seed (x INTEGER)")
            .unwrap();
        conn
    }

    /// Insert a job with its steps, in order.
    pub fn add_job(&self, job: &NewJob, steps: &[NewStep]) -> JobId {
        let store = self.store();
        let job_id = store.add_job(job).unwrap();
        for step in steps {
            store.add_step(job_id, step).unwrap();
        }
        job_id
    }

    /// Status of the latest run of `job_id` and its step log entries.
    pub fn last_run(&self, job_id: JobId) -> (JobLogEntry, Vec<StepLogEntry>) {
        let store = self.store();
        let log = store.latest_job_log(job_id).unwrap().expect("job never ran");
        let steps = store.step_logs(log.id).unwrap();
        (log, steps)
    }

    pub async fn run_job(&self, job_id: JobId) -> JobStatus {
        self.spawn_job(job_id).join().await.unwrap()
    }

    pub fn spawn_job(&self, job_id: JobId) -> TaskHandle<JobStatus> {
        spawn_job_in(&self.context(), job_id)
    }
}

/// Start a job controller on `ctx`'s pool, the way the engine does.
pub fn spawn_job_in(ctx: &AgentContext, job_id: JobId) -> TaskHandle<JobStatus> {
    let controller = JobController::instantiate(ctx.clone(), job_id).unwrap();
    ctx.pool.spawn_coordinator(controller)
}

/// Poll `check` until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
