use std::{fmt, sync::Arc, time::Duration};

use tokio::time::Instant;

/// A `Metric` is a single observed measurement that an [`crate::Aggregate`] knows
/// how to fold into its compact representation.
///
/// The engine produces one [`ExecutionResult`] per task call; latency histograms
/// consume bare [`Duration`]s.
pub trait Metric
where
    Self: Send + Sync + Clone,
{
}

impl Metric for Duration {}

/// Coarse classification of a failed execution, used for the per-kind counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused/reset, DNS and other transport failures.
    Network,
    /// The call completed with a non-success status.
    Protocol,
    Timeout,
    /// The request was still in flight when the pool forcibly shut down.
    Cancelled,
}

/// Why an execution failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    Network(String),
    Status(u16),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Network(reason) => write!(f, "network error: {reason}"),
            Failure::Status(status) => write!(f, "unexpected status {status}"),
        }
    }
}

/// The outcome of a single execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(Failure),
    Timeout,
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// `None` for successes.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success => None,
            Outcome::Failure(Failure::Network(_)) => Some(ErrorKind::Network),
            Outcome::Failure(Failure::Status(_)) => Some(ErrorKind::Protocol),
            Outcome::Timeout => Some(ErrorKind::Timeout),
            Outcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }
}

/// Everything observed about one task execution. Immutable once produced.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    /// Name of the task as registered in the [`crate::TaskSet`].
    pub task: Arc<str>,
    pub started: Instant,
    /// Wall-clock time spent inside the task call.
    pub duration: Duration,
    pub outcome: Outcome,
    /// Response size in bytes.
    pub bytes: usize,
}

impl ExecutionResult {
    /// Marker for a request that was discarded by a forced shutdown.
    pub fn cancelled(task: Arc<str>, started: Instant) -> Self {
        Self {
            task,
            started,
            duration: started.elapsed(),
            outcome: Outcome::Cancelled,
            bytes: 0,
        }
    }
}

impl Metric for ExecutionResult {}
