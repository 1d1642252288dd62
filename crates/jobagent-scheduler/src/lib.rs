//! `jobagent-scheduler`: the execution engine.
//!
//! # Overview
//!
//! The [`engine::SchedulerEngine`] loop claims due jobs from the store and
//! starts a [`job::JobController`] per job as a coordinator of the shared
//! [`pool::WorkerPool`]. Each controller submits one [`step::StepExecutor`]
//! per enabled step to the pool, holding a barrier before every step that is
//! not marked to run in parallel with its predecessor. Only steps occupy
//! pool slots.
//!
//! Cancellation flows down a tree of `CancellationToken`s: engine shutdown or
//! a kill-job signal cancels a controller, a controller timeout cancels its
//! steps, and a step timeout cancels only that step.

pub mod context;
pub mod engine;
pub mod job;
pub mod mail;
pub mod pool;
pub mod step;

pub use context::AgentContext;
pub use engine::{EngineHandle, LoopState, SchedulerEngine};
pub use job::{resolve_job_status, JobController};
pub use mail::{render_template, LogMailer};
pub use pool::{CancellableTask, TaskHandle, WorkerPool};
pub use step::{StepExecutor, StepOutcome};
