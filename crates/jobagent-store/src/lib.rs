//! `jobagent-store`: SQLite backend for the job agent.
//!
//! Every database is a file under `database.data_dir`. The job store holds
//! six tables:
//!
//! | Table             | Contents                                          |
//! |-------------------|---------------------------------------------------|
//! | `job`             | definition, host affinity, claim and next run     |
//! | `job_step`        | ordered steps with kind and on-error policy codes |
//! | `job_log`         | one row per job run                               |
//! | `job_step_log`    | one row per step run                              |
//! | `job_agent`       | registered agents and their last heartbeat        |
//! | `kill_job_signal` | the kill-job notification channel                 |

pub mod catalog;
pub mod connector;
pub mod db;
pub mod error;
pub mod schedule;
pub mod sqlite;

pub use catalog::{JobClaim, JobLogEntry, NewJob, NewStep, StepLogEntry};
pub use connector::{SqliteConnector, SqliteTargetSession};
pub use error::{Result, StoreError};
pub use schedule::{compute_next_run, Schedule};
pub use sqlite::SqliteStore;
