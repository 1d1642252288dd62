use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::types::Credential;

pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_NAME: &str = "jobagent";
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_CONNECTION_RETRY_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 40;
/// How often a running job re-checks timeouts and cancellation.
pub const DEFAULT_JOB_POLL_CHECK_MS: u64 = 200;
/// Agents silent for longer than this are treated as crashed.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 60;

/// Top-level config (jobagent.toml + JOBAGENT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobAgentConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub email: EmailConfig,
}

/// The shared store, and the default target for SQL steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    /// Database holding the job tables.
    #[serde(default = "default_db_name")]
    pub name: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Directory holding one `<name>.db` file per database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            name: default_db_name(),
            user: None,
            password: None,
            data_dir: default_data_dir(),
        }
    }
}

impl DatabaseConfig {
    /// The agent's own login, last in every SQL step's credential chain.
    pub fn credential(&self) -> Credential {
        Credential::new(self.user.clone(), self.password.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Station name registered in the store and matched against a job's host
    /// affinity.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    #[serde(default = "default_connection_retry_interval_ms")]
    pub connection_retry_interval_ms: u64,
    /// Each job and each step takes up to one slot while it runs.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_job_poll_check_ms")]
    pub job_poll_check_ms: u64,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            job_poll_interval_ms: DEFAULT_JOB_POLL_INTERVAL_MS,
            connection_retry_interval_ms: DEFAULT_CONNECTION_RETRY_INTERVAL_MS,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            job_poll_check_ms: DEFAULT_JOB_POLL_CHECK_MS,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
        }
    }
}

impl AgentSettings {
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval_ms)
    }

    pub fn job_poll_check(&self) -> Duration {
        Duration::from_millis(self.job_poll_check_ms.max(1))
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// Step notification settings. Template tokens are plain words because
/// annotation values cannot carry punctuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_email_from")]
    pub from: String,
    #[serde(default = "default_status_token")]
    pub status_token: String,
    #[serde(default = "default_job_name_token")]
    pub job_name_token: String,
    #[serde(default = "default_step_name_token")]
    pub step_name_token: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from: default_email_from(),
            status_token: default_status_token(),
            job_name_token: default_job_name_token(),
            step_name_token: default_step_name_token(),
        }
    }
}

fn default_db_host() -> String {
    DEFAULT_DB_HOST.to_string()
}
fn default_db_name() -> String {
    DEFAULT_DB_NAME.to_string()
}
fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".jobagent")
}
fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
fn default_job_poll_interval_ms() -> u64 {
    DEFAULT_JOB_POLL_INTERVAL_MS
}
fn default_connection_retry_interval_ms() -> u64 {
    DEFAULT_CONNECTION_RETRY_INTERVAL_MS
}
fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}
fn default_job_poll_check_ms() -> u64 {
    DEFAULT_JOB_POLL_CHECK_MS
}
fn default_agent_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}
fn default_email_from() -> String {
    "noreply@localhost".to_string()
}
fn default_status_token() -> String {
    "status".to_string()
}
fn default_job_name_token() -> String {
    "jobname".to_string()
}
fn default_step_name_token() -> String {
    "stepname".to_string()
}

impl JobAgentConfig {
    /// Load config from a TOML file with JOBAGENT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobagent/jobagent.toml
    ///
    /// A missing file is not an error; every field has a default. Nested
    /// env keys use a double underscore: `JOBAGENT_AGENT__WORKER_POOL_SIZE=8`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobAgentConfig = Figment::from(Serialized::defaults(JobAgentConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBAGENT_").split("__"))
            .extract()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.worker_pool_size == 0 {
            return Err(AgentError::Config(
                "agent.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.database.name.trim().is_empty() {
            return Err(AgentError::Config("database.name must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobagent/jobagent.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = JobAgentConfig::default();
        assert_eq!(cfg.database.host, "localhost");
        assert_eq!(cfg.database.name, "jobagent");
        assert_eq!(cfg.agent.job_poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.agent.connection_retry_interval(), Duration::from_secs(30));
        assert_eq!(cfg.agent.worker_pool_size, 40);
        assert_eq!(cfg.agent.job_poll_check(), Duration::from_millis(200));
        assert!(!cfg.agent.hostname.is_empty());
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nname = \"ops\"\nuser = \"agent\"\n\n[agent]\nhostname = \"db01\"\nworker_pool_size = 4\n"
        )
        .unwrap();

        let cfg = JobAgentConfig::load(file.path().to_str()).expect("config loads");
        assert_eq!(cfg.database.name, "ops");
        assert_eq!(cfg.database.host, "localhost");
        assert_eq!(
            cfg.database.credential(),
            Credential::new(Some("agent".to_string()), None)
        );
        assert_eq!(cfg.agent.hostname, "db01");
        assert_eq!(cfg.agent.worker_pool_size, 4);
        assert_eq!(cfg.agent.job_poll_interval_ms, DEFAULT_JOB_POLL_INTERVAL_MS);
        assert_eq!(cfg.email.status_token, "status");
    }

    #[test]
    fn rejects_empty_pool() {
        let mut cfg = JobAgentConfig::default();
        cfg.agent.worker_pool_size = 0;
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));
    }
}
