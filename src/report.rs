use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::stats::Snapshot;

/// A [`Report`] represents the processed form of a [`Snapshot`].
///
/// Reports turn the merged counters and histograms into figures people read:
/// rates, percentiles and totals. They are plain data with no I/O and are built
/// from a snapshot with a [`From`] implementation. Once created, a report can be
/// serialized, logged or handed to a [`Reporter`].
///
/// # Example
/// ```rust
/// use stampede::{Report, Snapshot};
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct Latency {
///     p99: Duration,
/// }
///
/// impl From<&Snapshot> for Latency {
///     fn from(s: &Snapshot) -> Self {
///         Self { p99: s.percentile(99.0) }
///     }
/// }
///
/// impl Report for Latency {}
/// ```
pub trait Report
where
    Self: Send + Sync + Debug + for<'a> From<&'a Snapshot>,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: printing it,
/// sending it to a service or persisting it somewhere.
///
/// # Example
/// ```rust
/// use stampede::{Report, Reporter};
/// struct Stdout;
/// impl<R: Report> Reporter<R> for Stdout {
///     async fn report(&self, report: &R) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///         println!("{:?}", report);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter<R: Report> {
    fn report(
        &self,
        report: &R,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Headline figures of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub elapsed: Duration,
    pub users: usize,
    pub requests: u64,
    pub failures: u64,
    pub error_rate: f64,
    /// Average requests per second since the start.
    pub rps: f64,
    /// Requests per second over the last complete window.
    pub recent_rps: f64,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub mean: Duration,
    pub max: Duration,
    pub faults: u64,
}

impl From<&Snapshot> for SummaryReport {
    fn from(s: &Snapshot) -> Self {
        Self {
            elapsed: s.elapsed,
            users: s.users,
            requests: s.total_count(),
            failures: s.error_count(),
            error_rate: s.error_rate(),
            rps: s.throughput(),
            recent_rps: s.recent_throughput(),
            p50: s.percentile(50.0),
            p90: s.percentile(90.0),
            p95: s.percentile(95.0),
            p99: s.percentile(99.0),
            mean: s.total.latency.mean(),
            max: s.total.latency.max(),
            faults: s.faults,
        }
    }
}

impl Report for SummaryReport {}

/// Writes summaries through `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter<SummaryReport> for LogReporter {
    async fn report(
        &self,
        report: &SummaryReport,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!(
            elapsed = ?report.elapsed,
            users = report.users,
            requests = report.requests,
            failures = report.failures,
            faults = report.faults,
            "{:.1} rps ({:.1} recent), errors {:.2}%, p50 {:?} p90 {:?} p95 {:?} p99 {:?} max {:?}",
            report.rps,
            report.recent_rps,
            report.error_rate * 100.0,
            report.p50,
            report.p90,
            report.p95,
            report.p99,
            report.max,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::BucketLayout;

    #[test]
    fn summary_of_empty_snapshot() {
        let report = SummaryReport::from(&Snapshot::empty(BucketLayout::PowerOfTwo));
        assert_eq!(report.requests, 0);
        assert_eq!(report.error_rate, 0.0);
        assert_eq!(report.p99, Duration::ZERO);
    }

    #[tokio::test]
    async fn log_reporter_never_fails() {
        let report = SummaryReport::from(&Snapshot::empty(BucketLayout::PowerOfTwo));
        assert!(LogReporter.report(&report).await.is_ok());
    }
}
