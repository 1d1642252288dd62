use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jobagent_core::{
    config::{DatabaseConfig, JobAgentConfig},
    store::{StatementCanceller, Store, StoreConnector, TargetSession},
    types::{Credential, SqlTarget},
    AgentError,
};
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use tracing::debug;

use crate::{error::StoreError, sqlite::SqliteStore};

const TARGET_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens SQLite connections under `database.data_dir`.
///
/// Every database is the file `<data_dir>/<name>.db`. The job store is
/// created on first use; target databases must already exist. SQLite has no
/// logins, so the credential of a [`SqlTarget`] is accepted and ignored.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    database: DatabaseConfig,
    agent_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(config: &JobAgentConfig) -> Self {
        Self {
            database: config.database.clone(),
            agent_timeout: config.agent.agent_timeout(),
        }
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        self.database.data_dir.join(format!("{name}.db"))
    }

    /// Open the job store as a concrete [`SqliteStore`].
    pub fn open_store(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.database_path(&self.database.name), self.agent_timeout)
    }

    fn is_local_host(&self, host: &str) -> bool {
        host.is_empty()
            || host.eq_ignore_ascii_case(&self.database.host)
            || host.eq_ignore_ascii_case("localhost")
            || host == "127.0.0.1"
    }
}

impl StoreConnector for SqliteConnector {
    fn connect(&self) -> jobagent_core::Result<Box<dyn Store>> {
        Ok(Box::new(self.open_store()?))
    }

    fn connect_target(&self, target: &SqlTarget) -> jobagent_core::Result<Box<dyn TargetSession>> {
        if !self.is_local_host(&target.host) {
            return Err(AgentError::UnknownHost {
                host: target.host.clone(),
            });
        }
        if target.database.trim().is_empty() {
            return Err(AgentError::Database("no target database named".to_string()));
        }
        let path = self.database_path(&target.database);
        debug!(
            database = %target.database,
            user = target.credential.user.as_deref().unwrap_or(""),
            "opening target database"
        );
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| AgentError::Database(format!("{}: {e}", path.display())))?;
        conn.busy_timeout(TARGET_BUSY_TIMEOUT).map_err(sql_error)?;
        Ok(Box::new(SqliteTargetSession::new(conn)))
    }
}

/// A connection to a target database.
pub struct SqliteTargetSession {
    conn: Connection,
    canceller: Arc<SqliteCanceller>,
}

impl SqliteTargetSession {
    pub fn new(conn: Connection) -> Self {
        let canceller = Arc::new(SqliteCanceller {
            handle: conn.get_interrupt_handle(),
        });
        Self { conn, canceller }
    }
}

impl TargetSession for SqliteTargetSession {
    fn canceller(&self) -> Arc<dyn StatementCanceller> {
        self.canceller.clone()
    }

    fn execute(&mut self, sql: &str) -> jobagent_core::Result<()> {
        self.conn.execute_batch(sql).map_err(sql_error)
    }

    fn query_credentials(&mut self, sql: &str) -> jobagent_core::Result<Vec<Credential>> {
        let mut stmt = self.conn.prepare(sql).map_err(sql_error)?;
        if stmt.column_count() < 2 {
            return Err(AgentError::Database(
                "auth query must return a user and a password column".to_string(),
            ));
        }
        let rows = stmt
            .query_map([], |row| Ok(Credential::new(row.get(0)?, row.get(1)?)))
            .map_err(sql_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_error)
    }
}

/// Interrupts the statement running on its session's connection.
pub struct SqliteCanceller {
    handle: InterruptHandle,
}

impl StatementCanceller for SqliteCanceller {
    fn cancel(&self) {
        self.handle.interrupt();
    }
}

fn sql_error(err: rusqlite::Error) -> AgentError {
    match err.sqlite_error_code() {
        Some(ErrorCode::OperationInterrupted) => AgentError::Cancelled,
        _ => AgentError::Database(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(dir: &tempfile::TempDir) -> SqliteConnector {
        let mut config = JobAgentConfig::default();
        config.database.data_dir = dir.path().to_path_buf();
        config.database.name = "agent".to_string();
        SqliteConnector::new(&config)
    }

    fn target(database: &str) -> SqlTarget {
        SqlTarget {
            host: "localhost".to_string(),
            database: database.to_string(),
            credential: Credential::default(),
        }
    }

    #[test]
    fn store_file_is_created_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(&dir);
        let mut store = connector.connect().unwrap();
        assert!(store.is_valid());
        assert!(dir.path().join("agent.db").exists());
    }

    #[test]
    fn missing_target_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = connector(&dir).connect_target(&target("nope")).err().unwrap();
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert!(!dir.path().join("nope.db").exists());
    }

    #[test]
    fn foreign_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = target("agent");
        t.host = "db.example.org".to_string();
        let err = connector(&dir).connect_target(&t).err().unwrap();
        assert!(matches!(err, AgentError::UnknownHost { .. }));
    }

    #[test]
    fn target_session_executes_and_reads_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(&dir);
        Connection::open(connector.database_path("ops")).unwrap();

        let mut session = connector.connect_target(&target("ops")).unwrap();
        session
            .execute(
                "CREATE TABLE logins (user TEXT, password TEXT);
                 INSERT INTO logins VALUES ('alice', 'a1'), ('bob', NULL);",
            )
            .unwrap();
        let creds = session
            .query_credentials("SELECT user, password FROM logins ORDER BY user")
            .unwrap();
        assert_eq!(
            creds,
            vec![
                Credential::new(Some("alice".into()), Some("a1".into())),
                Credential::new(Some("bob".into()), None),
            ]
        );

        let err = session.query_credentials("SELECT user FROM logins").unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");

        let err = session.execute("SELECT * FROM missing_table").unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");
    }

    #[test]
    fn interrupted_statement_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(&dir);
        Connection::open(connector.database_path("ops")).unwrap();
        let mut session = connector.connect_target(&target("ops")).unwrap();

        let canceller = session.canceller();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });
        let err = session
            .execute(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                 SELECT COUNT(*) FROM n;",
            )
            .unwrap_err();
        interrupter.join().unwrap();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
