//! Bounded worker pool.
//!
//! Every task is spawned on the Tokio runtime immediately but only starts
//! running once it holds one of the pool's permits, so at most `capacity`
//! tasks execute at a time and the rest queue in submission order. A queued
//! task that is cancelled stops waiting and runs at once, so it can record
//! its abort.
//!
//! Coordinators (tasks that spend their life waiting on tasks they submit to
//! the same pool) are started with [`WorkerPool::spawn_coordinator`] and never
//! hold a permit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// A unit of work that runs once and observes cooperative cancellation.
#[async_trait]
pub trait CancellableTask: Send + 'static {
    type Output: Send + 'static;

    /// Label used in log lines.
    fn name(&self) -> String;

    async fn run(self, cancel: CancellationToken) -> Self::Output;
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by a running task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn submit<T: CancellableTask>(&self, task: T) -> TaskHandle<T::Output> {
        self.submit_with_token(task, CancellationToken::new())
    }

    /// Submit `task` observing `cancel`, typically a child of the caller's token.
    pub fn submit_with_token<T: CancellableTask>(
        &self,
        task: T,
        cancel: CancellationToken,
    ) -> TaskHandle<T::Output> {
        self.launch(task, cancel, true)
    }

    /// Start `task` outside the slot limit.
    pub fn spawn_coordinator<T: CancellableTask>(&self, task: T) -> TaskHandle<T::Output> {
        self.launch(task, CancellationToken::new(), false)
    }

    fn launch<T: CancellableTask>(
        &self,
        task: T,
        cancel: CancellationToken,
        bounded: bool,
    ) -> TaskHandle<T::Output> {
        let name = task.name();
        let permits = bounded.then(|| self.permits.clone());
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _permit = match permits {
                Some(permits) => tokio::select! {
                    // The semaphore is never closed, so acquisition only fails on shutdown.
                    permit = permits.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                },
                None => None,
            };
            task.run(token).await
        });
        TaskHandle {
            name,
            cancel,
            join,
            result: None,
        }
    }
}

/// Handle to a submitted task.
pub struct TaskHandle<T> {
    name: String,
    cancel: CancellationToken,
    join: JoinHandle<T>,
    result: Option<Result<T, JoinError>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation. The task decides how to wind down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some() || self.join.is_finished()
    }

    /// Wait up to `timeout` for the task to finish. Returns `true` once it has;
    /// the result is kept for [`TaskHandle::join`].
    pub async fn wait_for(&mut self, timeout: Duration) -> bool {
        if self.result.is_some() {
            return true;
        }
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(_) => false,
        }
    }

    pub async fn join(mut self) -> Result<T, JoinError> {
        match self.result.take() {
            Some(result) => result,
            None => self.join.await,
        }
    }
}
