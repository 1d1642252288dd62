use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use jobagent_core::{
    store::Store,
    types::{
        JobId, JobLogId, JobRecord, JobStatus, OnError, ReconcileReport, RunStatus, StepId,
        StepKind, StepLogId, StepLogUpdate, StepRecord, StoreCode,
    },
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::{
    db::{init_db, now, open_store, timestamp},
    error::{Result, StoreError},
    schedule::{compute_next_run, Schedule},
};

/// Kill-job signals older than this are pruned during reconciliation.
const SIGNAL_RETENTION_SECS: i64 = 3600;

/// One connection to the SQLite job store.
pub struct SqliteStore {
    conn: Connection,
    agent_timeout: Duration,
    /// Highest kill-job signal id this connection has consumed.
    signal_cursor: i64,
}

impl SqliteStore {
    /// Open the store at `path`, creating the file and schema if needed.
    pub fn open(path: &Path, agent_timeout: Duration) -> Result<Self> {
        Self::from_connection(open_store(path)?, agent_timeout)
    }

    /// Wrap an existing connection. Only signals published after this call
    /// are delivered by [`Store::listen_for_cancellation`].
    pub fn from_connection(conn: Connection, agent_timeout: Duration) -> Result<Self> {
        init_db(&conn)?;
        let signal_cursor =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM kill_job_signal", [], |row| {
                row.get(0)
            })?;
        Ok(Self {
            conn,
            agent_timeout,
            signal_cursor,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn load_job_record(&self, job_id: JobId) -> Result<JobRecord> {
        self.conn
            .query_row(
                "SELECT id, name, description FROM job WHERE id = ?1",
                [job_id],
                |row| {
                    Ok(JobRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::JobNotFound { id: job_id })
    }

    fn load_step_records(&self, job_id: JobId) -> Result<Vec<StepRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, description, kind, code, connection_string, database_name, on_error
             FROM job_step
             WHERE job_id = ?1 AND enabled = 1
             ORDER BY name, id",
        )?;
        let rows: Vec<(StepId, String, String, String, String, String, String, String)> = stmt
            .query_map([job_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut steps = Vec::with_capacity(rows.len());
        for (id, name, description, kind, code, connection_string, database_name, on_error) in rows
        {
            steps.push(StepRecord {
                job_id,
                id,
                name,
                description,
                kind: StepKind::parse_code(&kind)?,
                code,
                connection_string,
                database_name,
                on_error: OnError::parse_code(&on_error)?,
            });
        }
        Ok(steps)
    }

    fn claim(&self, agent_id: &str, hostname: &str) -> Result<Vec<JobId>> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE job SET agent_id = ?1, last_run = ?2
             WHERE enabled = 1
               AND agent_id IS NULL
               AND next_run IS NOT NULL
               AND next_run <= ?2
               AND (host_agent = '' OR host_agent = ?3)
             RETURNING id",
        )?;
        let ids = stmt
            .query_map(params![agent_id, now(), hostname], |row| row.get(0))?
            .collect::<std::result::Result<Vec<JobId>, _>>()?;
        Ok(ids)
    }

    fn reconcile(&mut self) -> Result<ReconcileReport> {
        let now_at = Utc::now();
        let timeout = chrono::Duration::from_std(self.agent_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let agent_cutoff = timestamp(now_at - timeout);
        let signal_cutoff = timestamp(now_at - chrono::Duration::seconds(SIGNAL_RETENTION_SECS));

        let tx = self.conn.transaction()?;

        let dead_agents =
            tx.execute("DELETE FROM job_agent WHERE last_seen < ?1", [&agent_cutoff])?;

        // Any claim whose agent is no longer registered is orphaned.
        let aborted_jobs = tx.execute(
            "UPDATE job_log SET status = 'd'
             WHERE status = 'r'
               AND job_id IN (
                   SELECT id FROM job
                   WHERE agent_id IS NOT NULL
                     AND agent_id NOT IN (SELECT agent_id FROM job_agent))",
            [],
        )?;

        let aborted_steps = tx.execute(
            "UPDATE job_step_log SET status = 'd'
             WHERE status = 'r'
               AND job_log_id IN (SELECT id FROM job_log WHERE status <> 'r')",
            [],
        )?;

        let orphaned: Vec<(JobId, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, schedule FROM job
                 WHERE agent_id IS NOT NULL
                   AND agent_id NOT IN (SELECT agent_id FROM job_agent)",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };
        for (job_id, schedule) in &orphaned {
            release(&tx, *job_id, schedule.as_deref(), None)?;
        }

        tx.execute("DELETE FROM kill_job_signal WHERE created_at < ?1", [&signal_cutoff])?;
        tx.commit()?;

        let report = ReconcileReport {
            dead_agents,
            aborted_jobs,
            aborted_steps,
            released_jobs: orphaned.len(),
        };
        if report != ReconcileReport::default() {
            info!(
                dead_agents = report.dead_agents,
                aborted_jobs = report.aborted_jobs,
                aborted_steps = report.aborted_steps,
                released_jobs = report.released_jobs,
                "reconciled crashed agents"
            );
        }
        Ok(report)
    }

    fn release_claim(&self, job_id: JobId, agent_id: &str) -> Result<()> {
        let schedule: Option<Option<String>> = self
            .conn
            .query_row("SELECT schedule FROM job WHERE id = ?1", [job_id], |row| row.get(0))
            .optional()?;
        match schedule {
            Some(schedule) => release(&self.conn, job_id, schedule.as_deref(), Some(agent_id)),
            None => Err(StoreError::JobNotFound { id: job_id }),
        }
    }

    fn drain_signals(&mut self) -> Result<Vec<JobId>> {
        let rows: Vec<(i64, JobId)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, job_id FROM kill_job_signal WHERE id > ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([self.signal_cursor], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };
        if let Some((last, _)) = rows.last() {
            self.signal_cursor = *last;
        }
        Ok(rows.into_iter().map(|(_, job_id)| job_id).collect())
    }
}

/// Clear the claim and set `next_run` from the job's schedule, if any. With a
/// `holder`, only that agent's claim is cleared.
fn release(
    conn: &Connection,
    job_id: JobId,
    schedule: Option<&str>,
    holder: Option<&str>,
) -> Result<()> {
    let next_run = schedule.and_then(|json| match serde_json::from_str::<Schedule>(json) {
        Ok(schedule) => compute_next_run(&schedule, Utc::now()).map(timestamp),
        Err(e) => {
            warn!(job_id, "bad schedule JSON, job will not be rescheduled: {e}");
            None
        }
    });
    let n = conn.execute(
        "UPDATE job SET agent_id = NULL, next_run = ?1
         WHERE id = ?2 AND (?3 IS NULL OR agent_id = ?3)",
        params![next_run, job_id, holder],
    )?;
    if n == 0 {
        warn!(job_id, holder, "job is not claimed by this agent, claim left in place");
    } else {
        debug!(job_id, next_run = ?next_run, "job claim released");
    }
    Ok(())
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Store for SqliteStore {
    fn is_valid(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn claim_due_jobs(&mut self, agent_id: &str, hostname: &str) -> jobagent_core::Result<Vec<JobId>> {
        Ok(self.claim(agent_id, hostname)?)
    }

    fn load_job(&mut self, job_id: JobId) -> jobagent_core::Result<JobRecord> {
        Ok(self.load_job_record(job_id)?)
    }

    fn load_enabled_steps(&mut self, job_id: JobId) -> jobagent_core::Result<Vec<StepRecord>> {
        Ok(self.load_step_records(job_id)?)
    }

    fn create_job_log(&mut self, job_id: JobId) -> jobagent_core::Result<JobLogId> {
        self.conn
            .execute(
                "INSERT INTO job_log (job_id, status, started_at) VALUES (?1, ?2, ?3)",
                params![job_id, RunStatus::Running.code(), now()],
            )
            .map_err(StoreError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_job_log(
        &mut self,
        log_id: JobLogId,
        status: JobStatus,
        duration: Duration,
    ) -> jobagent_core::Result<()> {
        self.conn
            .execute(
                "UPDATE job_log SET status = ?1, duration_ms = ?2 WHERE id = ?3",
                params![status.code(), duration_ms(duration), log_id],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn create_step_log(
        &mut self,
        job_log_id: JobLogId,
        step_id: StepId,
    ) -> jobagent_core::Result<StepLogId> {
        self.conn
            .execute(
                "INSERT INTO job_step_log (job_log_id, step_id, status, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_log_id, step_id, RunStatus::Running.code(), now()],
            )
            .map_err(StoreError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_step_log(
        &mut self,
        step_log_id: StepLogId,
        update: &StepLogUpdate,
    ) -> jobagent_core::Result<()> {
        self.conn
            .execute(
                "UPDATE job_step_log
                 SET status = ?1, result = ?2, output = ?3, duration_ms = ?4
                 WHERE id = ?5",
                params![
                    update.status.code(),
                    update.result,
                    update.output,
                    duration_ms(update.duration),
                    step_log_id
                ],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn reconcile_crashed_agents(&mut self) -> jobagent_core::Result<ReconcileReport> {
        Ok(self.reconcile()?)
    }

    fn register_agent(&mut self, agent_id: &str, hostname: &str) -> jobagent_core::Result<()> {
        self.conn
            .execute(
                "INSERT INTO job_agent (agent_id, station, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT (agent_id) DO UPDATE
                 SET station = excluded.station, last_seen = excluded.last_seen",
                params![agent_id, hostname, now()],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn heartbeat(&mut self, agent_id: &str) -> jobagent_core::Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE job_agent SET last_seen = ?1 WHERE agent_id = ?2",
                params![now(), agent_id],
            )
            .map_err(StoreError::from)?;
        Ok(n > 0)
    }

    fn release_job_claim(&mut self, job_id: JobId, agent_id: &str) -> jobagent_core::Result<()> {
        Ok(self.release_claim(job_id, agent_id)?)
    }

    fn listen_for_cancellation(&mut self) -> jobagent_core::Result<Vec<JobId>> {
        Ok(self.drain_signals()?)
    }

    fn notify_kill_job(&mut self, job_id: JobId) -> jobagent_core::Result<()> {
        self.conn
            .execute(
                "INSERT INTO kill_job_signal (job_id, created_at) VALUES (?1, ?2)",
                params![job_id, now()],
            )
            .map_err(StoreError::from)?;
        info!(job_id, "kill-job signal published");
        Ok(())
    }
}
