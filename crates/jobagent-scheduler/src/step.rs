//! Execution of a single job step.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobagent_core::{
    annotation::StepOverrides,
    store::{StatementCanceller, StoreConnector, TargetSession},
    types::{Credential, JobLogId, SqlTarget, StepId, StepLogUpdate, StepRecord},
    AgentError, OnError, Result, RunStatus, StepKind, StepStatus,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{context::AgentContext, mail::render_template, pool::CancellableTask};

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[cfg(windows)]
const SCRIPT_SUFFIX: &str = ".bat";
#[cfg(not(windows))]
const SCRIPT_SUFFIX: &str = ".sh";

const SPAWN_ATTEMPTS: u32 = 5;
const INTERRUPT_RETRY: Duration = Duration::from_millis(100);
/// How long to keep reading pipes after a killed script has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Final state of a step run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step_id: StepId,
    pub on_error: OnError,
    pub status: StepStatus,
    pub result: i64,
    pub output: String,
}

/// What happened, before the on-error policy is applied.
#[derive(Debug)]
enum Execution {
    Succeeded { result: i64, output: String },
    Failed { result: i64, output: String },
    Aborted { output: String },
}

/// Runs one step of one job run. Consumed by [`CancellableTask::run`].
#[derive(Clone)]
pub struct StepExecutor {
    ctx: AgentContext,
    job_log_id: JobLogId,
    job_name: String,
    record: StepRecord,
    overrides: StepOverrides,
}

impl StepExecutor {
    pub fn new(ctx: AgentContext, job_log_id: JobLogId, job_name: String, record: StepRecord) -> Self {
        let overrides = StepOverrides::from_description(&record.description);
        Self {
            ctx,
            job_log_id,
            job_name,
            record,
            overrides,
        }
    }

    pub fn step_id(&self) -> StepId {
        self.record.id
    }

    pub fn on_error(&self) -> OnError {
        self.record.on_error
    }

    /// Whether this step may start while its predecessors are still running.
    pub fn runs_in_parallel(&self) -> bool {
        self.overrides.run_in_parallel
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.overrides.timeout
    }

    async fn execute(&self, cancel: &CancellationToken) -> Execution {
        match self.record.kind {
            StepKind::Sql => self.run_sql(cancel).await,
            StepKind::Batch => self.run_batch(cancel).await,
        }
    }

    fn resolve(&self, execution: Execution) -> StepOutcome {
        let (status, result, output) = match execution {
            Execution::Succeeded { result, output } => (RunStatus::Succeed, result, output),
            Execution::Failed { result, output } => {
                (self.record.on_error.failure_status(), result, output)
            }
            Execution::Aborted { output } => (RunStatus::Aborted, 0, output),
        };
        StepOutcome {
            step_id: self.record.id,
            on_error: self.record.on_error,
            status,
            result,
            output,
        }
    }

    // -----------------------------------------------------------------------
    // SQL
    // -----------------------------------------------------------------------

    async fn run_sql(&self, cancel: &CancellationToken) -> Execution {
        if !self.record.connection_string.trim().is_empty() {
            return Execution::Failed {
                result: -1,
                output: AgentError::RemoteConnection.to_string(),
            };
        }

        let config = &self.ctx.config.database;
        let explicit = (self.overrides.database_login.is_some()
            || self.overrides.database_password.is_some())
        .then(|| {
            Credential::new(
                self.overrides.database_login.clone(),
                self.overrides.database_password.clone(),
            )
        });
        let work = SqlWork {
            connector: self.ctx.connector.clone(),
            host: self
                .overrides
                .database_host
                .clone()
                .unwrap_or_else(|| config.host.clone()),
            database: self
                .overrides
                .database_name
                .clone()
                .unwrap_or_else(|| self.record.database_name.clone()),
            explicit,
            auth_query: self.overrides.database_auth_query.clone(),
            fallback: config.credential(),
            code: self.record.code.clone(),
            active: Arc::default(),
            cancel: cancel.clone(),
        };
        let active = work.active.clone();

        let mut worker = tokio::task::spawn_blocking(move || work.run());
        let joined = tokio::select! {
            joined = &mut worker => joined,
            _ = cancel.cancelled() => {
                // An interrupt that lands before the statement starts is lost,
                // so keep interrupting until the worker gives up.
                loop {
                    let canceller = active.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    if let Some(canceller) = canceller {
                        debug!(step_id = self.record.id, "interrupting running statement");
                        canceller.cancel();
                    }
                    if let Ok(joined) = tokio::time::timeout(INTERRUPT_RETRY, &mut worker).await {
                        break joined;
                    }
                }
            }
        };

        match joined {
            Ok(Ok(())) => Execution::Succeeded {
                result: 1,
                output: String::new(),
            },
            Ok(Err(e)) if cancel.is_cancelled() => Execution::Aborted {
                output: e.to_string(),
            },
            Ok(Err(e)) => Execution::Failed {
                result: -1,
                output: e.to_string(),
            },
            Err(e) => Execution::Failed {
                result: -1,
                output: format!("SQL worker failed: {e}"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Batch
    // -----------------------------------------------------------------------

    async fn run_batch(&self, cancel: &CancellationToken) -> Execution {
        let script = match write_script(&self.record.code) {
            Ok(script) => script,
            Err(e) => {
                return Execution::Failed {
                    result: -1,
                    output: format!("could not write script: {e}"),
                }
            }
        };

        let mut child = match spawn_script(&script, &self.record.code).await {
            Ok(child) => child,
            Err(e) => {
                return Execution::Failed {
                    result: -1,
                    output: format!("could not start script: {e}"),
                }
            }
        };
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            _ = cancel.cancelled() => {
                debug!(step_id = self.record.id, "killing script");
                kill_child(&mut child);
                (child.wait().await, true)
            }
        };

        let mut output = String::new();
        append_lines(&mut output, &collect_reader(stdout, killed).await);
        append_lines(&mut output, &collect_reader(stderr, killed).await);

        if let Err(e) = script.close() {
            warn!(step_id = self.record.id, "could not remove script: {e}");
        }

        match status {
            Err(e) => Execution::Failed {
                result: -1,
                output: format!("could not wait for script: {e}"),
            },
            Ok(_) if killed => Execution::Aborted { output },
            Ok(status) => {
                let code = exit_code(&status);
                if code == 0 {
                    Execution::Succeeded { result: 0, output }
                } else {
                    Execution::Failed { result: code, output }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    fn notify(&self, outcome: &StepOutcome) {
        if !self.overrides.email_on.contains(&outcome.status) {
            return;
        }
        if self.overrides.email_to.is_empty() {
            warn!(
                step_id = self.record.id,
                status = %outcome.status,
                "EMAIL_ON matched but EMAIL_TO is empty"
            );
            return;
        }

        let tokens = &self.ctx.config.email;
        let subject = match &self.overrides.email_subject {
            Some(template) => {
                render_template(template, tokens, outcome.status, &self.job_name, &self.record.name)
            }
            None => format!("{}: {} {}", self.job_name, self.record.name, outcome.status),
        };
        let body = match &self.overrides.email_body {
            Some(template) => {
                render_template(template, tokens, outcome.status, &self.job_name, &self.record.name)
            }
            None => outcome.output.clone(),
        };

        if let Err(e) = self.ctx.mailer.send(&self.overrides.email_to, &subject, &body) {
            warn!(step_id = self.record.id, code = e.code(), "step mail not sent: {e}");
        }
    }
}

#[async_trait]
impl CancellableTask for StepExecutor {
    type Output = StepOutcome;

    fn name(&self) -> String {
        format!("step {}/{} ({})", self.record.job_id, self.record.id, self.record.name)
    }

    async fn run(self, cancel: CancellationToken) -> StepOutcome {
        let started = Instant::now();
        let step_id = self.record.id;

        let mut store = match self.ctx.connector.connect() {
            Ok(store) => store,
            Err(e) => {
                error!(step_id, code = e.code(), "step could not reach the store: {e}");
                return self.resolve(Execution::Failed {
                    result: -1,
                    output: e.to_string(),
                });
            }
        };
        let log_id = match store.create_step_log(self.job_log_id, step_id) {
            Ok(id) => id,
            Err(e) => {
                error!(step_id, code = e.code(), "could not create step log: {e}");
                return self.resolve(Execution::Failed {
                    result: -1,
                    output: e.to_string(),
                });
            }
        };

        // The step's own timeout cancels only this step.
        let token = cancel.child_token();
        let timer = self.overrides.timeout.map(|after| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if !token.is_cancelled() {
                    warn!(step_id, timeout_ms = after.as_millis() as u64, "step timed out");
                    token.cancel();
                }
            })
        });

        debug!(step_id, kind = ?self.record.kind, "step started");
        let execution = if token.is_cancelled() {
            Execution::Aborted {
                output: "cancelled before start".to_string(),
            }
        } else {
            // Own task, so a panic still ends in a step log update.
            let worker = self.clone();
            let worker_token = token.clone();
            match tokio::spawn(async move { worker.execute(&worker_token).await }).await {
                Ok(execution) => execution,
                Err(e) => {
                    error!(step_id, "step execution failed: {e}");
                    Execution::Failed {
                        result: -1,
                        output: e.to_string(),
                    }
                }
            }
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        let outcome = self.resolve(execution);
        let update = StepLogUpdate {
            status: outcome.status,
            result: outcome.result,
            output: outcome.output.clone(),
            duration: started.elapsed(),
        };
        if let Err(e) = store.update_step_log(log_id, &update) {
            error!(step_id, code = e.code(), "could not update step log: {e}");
        }
        info!(
            step_id,
            status = %outcome.status,
            result = outcome.result,
            duration_ms = update.duration.as_millis() as u64,
            "step finished"
        );

        self.notify(&outcome);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Blocking SQL work
// ---------------------------------------------------------------------------

/// Everything the blocking SQL worker needs, detached from the executor.
struct SqlWork {
    connector: Arc<dyn StoreConnector>,
    host: String,
    database: String,
    explicit: Option<Credential>,
    auth_query: Option<String>,
    fallback: Credential,
    code: String,
    /// Canceller of the session currently executing, if any.
    active: Arc<Mutex<Option<Arc<dyn StatementCanceller>>>>,
    cancel: CancellationToken,
}

impl SqlWork {
    fn run(self) -> Result<()> {
        let credentials = self.credential_chain()?;
        let mut last_error = None;
        for credential in credentials {
            match self.execute_as(credential) {
                Ok(()) => return Ok(()),
                Err(e) if self.cancel.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(database = %self.database, "credential rejected: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AgentError::Internal("no credentials to try".to_string())))
    }

    /// Explicit annotation login, then rows of the auth query, then the
    /// agent's own login when nothing else applies.
    fn credential_chain(&self) -> Result<Vec<Credential>> {
        let mut chain = Vec::new();
        if let Some(explicit) = &self.explicit {
            chain.push(explicit.clone());
        }
        if let Some(query) = &self.auth_query {
            let mut session = self.open(self.fallback.clone())?;
            let rows = session.query_credentials(query);
            self.clear_active();
            chain.extend(rows?);
        }
        if chain.is_empty() {
            chain.push(self.fallback.clone());
        }
        Ok(chain)
    }

    fn execute_as(&self, credential: Credential) -> Result<()> {
        let mut session = self.open(credential)?;
        let result = session.execute(&self.code);
        self.clear_active();
        result
    }

    fn open(&self, credential: Credential) -> Result<Box<dyn TargetSession>> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let session = self.connector.connect_target(&SqlTarget {
            host: self.host.clone(),
            database: self.database.clone(),
            credential,
        })?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.canceller());
        // Cancellation that raced the registration above.
        if self.cancel.is_cancelled() {
            self.clear_active();
            return Err(AgentError::Cancelled);
        }
        Ok(session)
    }

    fn clear_active(&self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

// ---------------------------------------------------------------------------
// Script helpers
// ---------------------------------------------------------------------------

fn normalize_line_endings(code: &str) -> String {
    let unix = code.replace("\r\n", "\n").replace('\r', "\n");
    if LINE_ENDING == "\n" {
        unix
    } else {
        unix.replace('\n', LINE_ENDING)
    }
}

/// Write `code` to a fresh executable temp file, deleted when the returned
/// path is dropped or closed.
fn write_script(code: &str) -> std::io::Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("jobagent_")
        .suffix(SCRIPT_SUFFIX)
        .tempfile()?;
    file.write_all(normalize_line_endings(code).as_bytes())?;
    file.as_file().sync_all()?;
    let path = file.into_temp_path();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}

fn script_command(path: &Path, code: &str) -> Command {
    #[cfg(windows)]
    {
        let _ = code;
        let mut cmd = std::process::Command::new("cmd");
        cmd.arg("/C").arg(path);
        Command::from(cmd)
    }
    #[cfg(not(windows))]
    {
        use std::os::unix::process::CommandExt;

        let mut cmd = if code.starts_with("#!") {
            std::process::Command::new(path)
        } else {
            let mut sh = std::process::Command::new("/bin/sh");
            sh.arg(path);
            sh
        };
        // Own process group so a kill reaches the script's children too.
        cmd.process_group(0);
        Command::from(cmd)
    }
}

async fn spawn_script(path: &Path, code: &str) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let spawned = script_command(path, code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            // A concurrent fork can briefly hold the script open for writing.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: `pid` leads the process group created for this child.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
        return;
    }
    if let Err(e) = child.start_kill() {
        debug!("kill failed: {e}");
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut bytes = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut bytes).await {
                debug!("pipe read failed: {e}");
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

async fn collect_reader(reader: Option<JoinHandle<String>>, killed: bool) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    if killed {
        match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => {
                reader.abort();
                String::new()
            }
        }
    } else {
        reader.await.unwrap_or_default()
    }
}

fn append_lines(output: &mut String, text: &str) {
    for line in text.lines() {
        output.push_str(line);
        output.push_str(LINE_ENDING);
    }
}

fn exit_code(status: &ExitStatus) -> i64 {
    match status.code() {
        Some(code) => i64::from(code),
        None => -1,
    }
}
