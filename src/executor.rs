//! RequestExecutor: runs one task and turns whatever happens into an
//! [`ExecutionResult`].
//!
//! The executor never fails. Transport errors, non-2xx statuses and deadline
//! overruns are all encoded in [`Outcome`]. Timing wraps the task call only; the
//! time a user spends waiting for a throttle permit or picking a task is not part
//! of the measured latency.
use std::time::Duration;

use tokio::time::Instant;

use crate::{
    metric::{ExecutionResult, Failure, Outcome},
    task::{Reply, Task, TaskEntry, TaskError},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct RequestExecutor {
    timeout: Option<Duration>,
}

impl RequestExecutor {
    /// `timeout` bounds every call; `None` lets calls run as long as the task does.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn execute<T: Task>(&self, entry: &TaskEntry<T>) -> ExecutionResult {
        let started = Instant::now();
        let call = entry.task().call();
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(TaskError::Timeout)),
            None => call.await,
        };
        let duration = started.elapsed();
        let (outcome, bytes) = classify(response);

        ExecutionResult {
            task: entry.name().clone(),
            started,
            duration,
            outcome,
            bytes,
        }
    }
}

/// Map a raw task response to an outcome and the number of bytes received.
pub fn classify(response: Result<Reply, TaskError>) -> (Outcome, usize) {
    match response {
        Ok(reply) if reply.is_success() => (Outcome::Success, reply.bytes),
        Ok(reply) => (Outcome::Failure(Failure::Status(reply.status)), reply.bytes),
        Err(TaskError::Network(reason)) => (Outcome::Failure(Failure::Network(reason)), 0),
        Err(TaskError::Timeout) => (Outcome::Timeout, 0),
    }
}
