use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the store database at `path` and apply the schema.
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the agent schema in `conn`.
///
/// All tables are idempotent. Timestamps are RFC 3339 UTC strings with
/// millisecond precision so that text comparison orders them correctly.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job (
            id          INTEGER PRIMARY KEY,
            name        TEXT    NOT NULL,
            description TEXT    NOT NULL DEFAULT '',
            enabled     INTEGER NOT NULL DEFAULT 1,
            host_agent  TEXT    NOT NULL DEFAULT '', -- '' runs anywhere
            agent_id    TEXT,                        -- claiming agent or NULL
            schedule    TEXT,                        -- JSON-encoded Schedule or NULL
            next_run    TEXT,
            last_run    TEXT,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_next_run ON job (next_run);

        CREATE TABLE IF NOT EXISTS job_step (
            id                INTEGER PRIMARY KEY,
            job_id            INTEGER NOT NULL REFERENCES job (id) ON DELETE CASCADE,
            name              TEXT    NOT NULL,
            description       TEXT    NOT NULL DEFAULT '',
            enabled           INTEGER NOT NULL DEFAULT 1,
            kind              TEXT    NOT NULL CHECK (kind IN ('s', 'b')),
            code              TEXT    NOT NULL DEFAULT '',
            connection_string TEXT    NOT NULL DEFAULT '',
            database_name     TEXT    NOT NULL DEFAULT '',
            on_error          TEXT    NOT NULL DEFAULT 'f' CHECK (on_error IN ('f', 's', 'i'))
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_step_job ON job_step (job_id);

        CREATE TABLE IF NOT EXISTS job_log (
            id          INTEGER PRIMARY KEY,
            job_id      INTEGER NOT NULL REFERENCES job (id) ON DELETE CASCADE,
            status      TEXT    NOT NULL DEFAULT 'r',
            started_at  TEXT    NOT NULL,
            duration_ms INTEGER
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_step_log (
            id          INTEGER PRIMARY KEY,
            job_log_id  INTEGER NOT NULL REFERENCES job_log (id) ON DELETE CASCADE,
            step_id     INTEGER NOT NULL REFERENCES job_step (id) ON DELETE CASCADE,
            status      TEXT    NOT NULL DEFAULT 'r',
            result      INTEGER,
            output      TEXT,
            started_at  TEXT    NOT NULL,
            duration_ms INTEGER
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_agent (
            agent_id   TEXT NOT NULL PRIMARY KEY,
            station    TEXT NOT NULL,
            last_seen  TEXT NOT NULL
        ) STRICT;

        -- Kill-job channel. Listeners remember the last id they consumed.
        CREATE TABLE IF NOT EXISTS kill_job_signal (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id     INTEGER NOT NULL,
            created_at TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Store timestamp format.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'job%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(5);
        assert!(timestamp(early) < timestamp(late));
        assert_eq!(timestamp(early), "2024-01-01T09:00:00.000Z");
    }
}
