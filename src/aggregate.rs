use std::fmt::Debug;

use crate::{
    histogram::{BucketLayout, LatencyHistogram},
    metric::{ErrorKind, ExecutionResult, Metric},
};

/// The `Aggregate` trait defines how raw [`Metric`] values are folded into an
/// intermediate, mergeable representation.
///
/// Aggregates store counters and histograms, never final statistics: percentiles,
/// rates and ratios are derived on read by [`crate::stats::Snapshot`] and
/// [`crate::Report`]s.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: windows and per-task
///   tallies are merged in arbitrary order.
/// - `consume` sits on the hot path of every virtual user; keep it allocation-free.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Aggregate multiple metrics into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Fold another aggregate into this one.
    fn merge(&mut self, other: &Self);
}

/// Failure counters, one per [`ErrorKind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub network: u64,
    pub protocol: u64,
    pub timeout: u64,
    pub cancelled: u64,
}

impl ErrorCounts {
    pub fn increment(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::Network => self.network += 1,
            ErrorKind::Protocol => self.protocol += 1,
            ErrorKind::Timeout => self.timeout += 1,
            ErrorKind::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::Network => self.network,
            ErrorKind::Protocol => self.protocol,
            ErrorKind::Timeout => self.timeout,
            ErrorKind::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        self.network + self.protocol + self.timeout + self.cancelled
    }

    pub fn merge(&mut self, other: &Self) {
        self.network += other.network;
        self.protocol += other.protocol;
        self.timeout += other.timeout;
        self.cancelled += other.cancelled;
    }
}

/// Counters and latency distribution for a set of executions.
///
/// Cancelled executions are counted but kept out of the latency histogram: their
/// duration measures the shutdown, not the system under test.
#[derive(Clone, Debug, PartialEq)]
pub struct Tally {
    pub count: u64,
    pub errors: ErrorCounts,
    pub bytes: u64,
    pub latency: LatencyHistogram,
}

impl Tally {
    pub fn new(layout: BucketLayout) -> Self {
        Self {
            count: 0,
            errors: ErrorCounts::default(),
            bytes: 0,
            latency: LatencyHistogram::new(layout),
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.total()
    }

    /// Failed fraction in `0.0..=1.0`; zero when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count() as f64 / self.count as f64
        }
    }
}

impl Aggregate for Tally {
    type Metric = ExecutionResult;

    fn consume(&mut self, metric: &Self::Metric) {
        self.count += 1;
        self.bytes += metric.bytes as u64;
        match metric.outcome.error_kind() {
            Some(ErrorKind::Cancelled) => self.errors.increment(ErrorKind::Cancelled),
            Some(kind) => {
                self.errors.increment(kind);
                self.latency.record(metric.duration);
            }
            None => self.latency.record(metric.duration),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.bytes += other.bytes;
        self.errors.merge(&other.errors);
        self.latency.merge(&other.latency);
    }
}
