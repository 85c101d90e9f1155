//! Stampede: a load-generation engine for HTTP and other request/response
//! services.
//!
//! A run simulates a population of concurrent *virtual users*. Each user picks a
//! task from a weighted [`TaskSet`], executes it, records the outcome and pauses
//! for a configurable think time. A [`Controller`] walks through a list of
//! [`Stage`]s, telling the [`UserPool`] how many users to keep alive, while a
//! [`StatsAggregator`] collects throughput, latency and error statistics in time
//! windows.
//!
//! # Architecture
//!
//! - [`Task`]: a unit of work. Implement it for your own workload type or use the
//!   built-in [`HttpGet`] (feature `http`).
//! - [`RequestExecutor`]: runs one task call with a deadline and turns the result
//!   into an [`ExecutionResult`]. It never fails.
//! - [`VirtualUser`]: the sequential actor looping over tasks.
//! - [`UserPool`]: spawns, retires and replaces virtual users to match a target.
//! - [`StatsAggregator`]: thread-safe sink that rolls results into windows and
//!   produces [`Snapshot`]s.
//! - [`Throttle`]: optional global requests-per-second cap.
//! - [`Controller`]: the schedule. It owns everything above for one run.
//! - [`Report`] / [`Reporter`]: turn snapshots into readable output.
//!
//! # Example
//! ```rust,no_run
//! use std::time::Duration;
//! use stampede::{Controller, EngineConfig, Reply, Stage, Task, TaskError, TaskSet};
//!
//! struct Noop;
//!
//! impl Task for Noop {
//!     async fn call(&self) -> Result<Reply, TaskError> {
//!         tokio::time::sleep(Duration::from_millis(5)).await;
//!         Ok(Reply::new(200, 0))
//!     }
//! }
//!
//! # async fn run() -> stampede::Result<()> {
//! let config = EngineConfig::builder()
//!     .stages(vec![Stage::new(Duration::from_secs(30), 10)])
//!     .build();
//! let tasks = TaskSet::builder().task("noop", Noop).build()?;
//! let summary = Controller::new(config, tasks)?.run().await?;
//! println!("{} requests", summary.snapshot.total_count());
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//! - `http` (default): the [`HttpGet`] task, backed by `reqwest`.
//! - `internals`: enable access to internal (and unstable) functions such as the
//!   token arithmetic of the throttle.

/// Metric aggregators
pub mod aggregate;
/// Engine configuration
pub mod config;
/// Stage schedule and run orchestration
pub mod controller;
pub mod error;
pub mod executor;
pub mod histogram;
#[cfg(feature = "http")]
pub mod http;
/// Single metrics
pub mod metric;
pub mod pool;
/// Reports and Reporters
pub mod report;
pub mod stats;
pub mod task;
pub mod throttle;
pub mod user;

pub use aggregate::{Aggregate, ErrorCounts, Tally};
pub use config::{EngineConfig, ThinkTime};
pub use controller::{Controller, RunSummary, Stage, StopHandle};
pub use error::{Error, Result};
pub use executor::RequestExecutor;
pub use histogram::{BucketLayout, LatencyHistogram};
#[cfg(feature = "http")]
pub use http::HttpGet;
pub use metric::{ErrorKind, ExecutionResult, Failure, Metric, Outcome};
pub use pool::{PoolSettings, ShutdownReport, UserPool};
pub use report::{LogReporter, Report, Reporter, SummaryReport};
pub use stats::{AggregateWindow, Snapshot, StatsAggregator};
pub use task::{Reply, Task, TaskError, TaskSet};
pub use throttle::Throttle;
pub use user::{UserContext, UserExit, UserState, VirtualUser};
