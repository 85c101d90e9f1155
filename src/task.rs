//! Tasks: the units of work a virtual user performs.
//!
//! A workload is a single, closed type implementing [`Task`] (usually an enum with
//! one variant per endpoint, or one struct instantiated several times). A
//! [`TaskSet`] names each instance and gives it a relative weight; virtual users
//! draw from it with a [`TaskPicker`].
use std::{collections::HashSet, future::Future, sync::Arc};

use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};
use thiserror::Error;

use crate::error::{Error, Result};

/// What a task reports back once its call completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    /// Protocol status code (HTTP status for HTTP tasks).
    pub status: u16,
    /// Size of the response payload in bytes.
    pub bytes: usize,
}

impl Reply {
    pub fn new(status: u16, bytes: usize) -> Self {
        Self { status, bytes }
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failures a task can report.
///
/// Non-success statuses are *not* errors at this level; they come back as a
/// [`Reply`] and are classified by the [`crate::RequestExecutor`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Connection refused/reset, DNS failure, broken body stream...
    #[error("network error: {0}")]
    Network(String),
    /// The underlying client gave up waiting.
    #[error("request timed out")]
    Timeout,
}

/// A unit of work with a uniform `call` capability.
///
/// Implementations must not keep mutable state between calls: the same task value
/// is shared by every virtual user.
///
/// # Example
/// ```rust
/// use std::future::Future;
/// use stampede::{Reply, Task, TaskError};
///
/// enum Ping {
///     Health,
///     Version,
/// }
///
/// impl Task for Ping {
///     fn call(&self) -> impl Future<Output = Result<Reply, TaskError>> + Send {
///         let bytes = match self {
///             Ping::Health => 2,
///             Ping::Version => 5,
///         };
///         async move { Ok(Reply::new(200, bytes)) }
///     }
/// }
/// ```
pub trait Task: Send + Sync + 'static {
    fn call(&self) -> impl Future<Output = std::result::Result<Reply, TaskError>> + Send;

    /// Per-user setup (log in, warm a cache...). Each virtual user calls it once
    /// for every task of its set before its first request.
    fn on_start(&self, user: usize) -> impl Future<Output = ()> + Send {
        let _ = user;
        async {}
    }

    /// Per-user teardown, the counterpart of [`Task::on_start`]. Runs when the
    /// user leaves its loop; a user aborted at the end of the grace period skips it.
    fn on_stop(&self, user: usize) -> impl Future<Output = ()> + Send {
        let _ = user;
        async {}
    }
}

/// A named, weighted task inside a [`TaskSet`].
#[derive(Debug)]
pub struct TaskEntry<T> {
    name: Arc<str>,
    weight: u32,
    task: T,
}

impl<T> TaskEntry<T> {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn task(&self) -> &T {
        &self.task
    }
}

/// The weighted set of tasks shared by all virtual users of a run.
#[derive(Debug)]
pub struct TaskSet<T> {
    entries: Vec<TaskEntry<T>>,
    weights: WeightedIndex<u32>,
}

impl<T: Task> TaskSet<T> {
    pub fn builder() -> TaskSetBuilder<T> {
        TaskSetBuilder {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TaskEntry<T>> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[TaskEntry<T>] {
        &self.entries
    }

    /// Create an independent picker. With a seed the selection sequence is fully
    /// reproducible; without one the picker is seeded from the OS.
    pub fn picker(&self, seed: Option<u64>) -> TaskPicker {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        TaskPicker {
            weights: self.weights.clone(),
            rng,
        }
    }
}

/// Collects tasks for a [`TaskSet`]. Tasks added with [`TaskSetBuilder::task`]
/// get weight 1.
pub struct TaskSetBuilder<T> {
    entries: Vec<TaskEntry<T>>,
}

impl<T: Task> TaskSetBuilder<T> {
    pub fn task(self, name: impl Into<Arc<str>>, task: T) -> Self {
        self.weighted(name, 1, task)
    }

    pub fn weighted(mut self, name: impl Into<Arc<str>>, weight: u32, task: T) -> Self {
        self.entries.push(TaskEntry {
            name: name.into(),
            weight,
            task,
        });
        self
    }

    /// Rejects empty sets, zero weights and duplicate names.
    pub fn build(self) -> Result<TaskSet<T>> {
        if self.entries.is_empty() {
            return Err(Error::config("task set is empty"));
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.weight == 0 {
                return Err(Error::config(format!(
                    "task `{}` has weight 0",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.clone()) {
                return Err(Error::config(format!(
                    "task `{}` is registered twice",
                    entry.name
                )));
            }
        }
        let weights = WeightedIndex::new(self.entries.iter().map(|e| e.weight))
            .map_err(|e| Error::config(format!("invalid task weights: {e}")))?;
        Ok(TaskSet {
            entries: self.entries,
            weights,
        })
    }
}

/// Weighted random selection over a [`TaskSet`], owned by a single virtual user.
#[derive(Debug, Clone)]
pub struct TaskPicker {
    weights: WeightedIndex<u32>,
    rng: StdRng,
}

impl TaskPicker {
    /// Index of the next task to run.
    pub fn pick(&mut self) -> usize {
        self.weights.sample(&mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Quote {
        Forward,
        Reverse,
        Rare,
    }

    impl Task for Quote {
        async fn call(&self) -> std::result::Result<Reply, TaskError> {
            Ok(Reply::new(200, 0))
        }
    }

    fn quotes() -> TaskSet<Quote> {
        TaskSet::builder()
            .weighted("forward", 3, Quote::Forward)
            .weighted("reverse", 3, Quote::Reverse)
            .weighted("rare", 1, Quote::Rare)
            .build()
            .unwrap()
    }

    #[test]
    fn same_seed_same_sequence() {
        let set = quotes();
        let mut a = set.picker(Some(7));
        let mut b = set.picker(Some(7));
        let first: Vec<usize> = (0..500).map(|_| a.pick()).collect();
        let second: Vec<usize> = (0..500).map(|_| b.pick()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn different_seeds_diverge() {
        let set = quotes();
        let mut a = set.picker(Some(1));
        let mut b = set.picker(Some(2));
        let first: Vec<usize> = (0..200).map(|_| a.pick()).collect();
        let second: Vec<usize> = (0..200).map(|_| b.pick()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn selection_follows_weights() {
        let set = quotes();
        let mut picker = set.picker(Some(42));
        let mut hits = [0usize; 3];
        for _ in 0..70_000 {
            hits[picker.pick()] += 1;
        }
        // expected 30k / 30k / 10k
        assert!((27_000..33_000).contains(&hits[0]), "{hits:?}");
        assert!((27_000..33_000).contains(&hits[1]), "{hits:?}");
        assert!((8_500..11_500).contains(&hits[2]), "{hits:?}");
    }

    #[test]
    fn single_task_always_picked() {
        let set = TaskSet::builder().task("only", Quote::Forward).build().unwrap();
        let mut picker = set.picker(None);
        assert!((0..100).all(|_| picker.pick() == 0));
        assert_eq!(set.get(0).unwrap().task(), &Quote::Forward);
    }

    #[test]
    fn rejects_empty_set() {
        let err = TaskSet::<Quote>::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_weight() {
        let err = TaskSet::builder()
            .weighted("forward", 0, Quote::Forward)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("weight 0"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = TaskSet::builder()
            .task("quote", Quote::Forward)
            .task("quote", Quote::Reverse)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn reply_success_range() {
        assert!(Reply::new(200, 0).is_success());
        assert!(Reply::new(204, 0).is_success());
        assert!(!Reply::new(302, 0).is_success());
        assert!(!Reply::new(500, 0).is_success());
    }
}
