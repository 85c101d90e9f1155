//! Thread-safe statistics sink shared by every virtual user of a run.
//!
//! Results land in the *open* [`AggregateWindow`]. When the aggregator's clock
//! crosses into the next window, the open window is sealed and appended to the
//! closed list, which is never mutated again. Sealing also folds the window into
//! a running total, so a snapshot only copies that total and the open window
//! under the lock and merges the two outside of it: its cost does not grow with
//! the number of windows. The list itself keeps one entry per non-empty window
//! for the whole run.
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::{
    aggregate::{Aggregate, Tally},
    histogram::BucketLayout,
    metric::ExecutionResult,
};

/// Time-bucketed rollup of the results recorded during one window.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateWindow {
    index: u64,
    total: Tally,
    tasks: BTreeMap<Arc<str>, Tally>,
}

impl AggregateWindow {
    pub fn new(index: u64, layout: BucketLayout) -> Self {
        Self {
            index,
            total: Tally::new(layout),
            tasks: BTreeMap::new(),
        }
    }

    /// Position of the window since the aggregator started (0-based).
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn total(&self) -> &Tally {
        &self.total
    }

    pub fn tasks(&self) -> &BTreeMap<Arc<str>, Tally> {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.total.count == 0
    }
}

impl Aggregate for AggregateWindow {
    type Metric = ExecutionResult;

    fn consume(&mut self, metric: &Self::Metric) {
        self.total.consume(metric);
        let layout = self.total.latency.layout();
        // only the first result of a task in a window allocates
        match self.tasks.get_mut(&metric.task) {
            Some(tally) => tally.consume(metric),
            None => {
                let mut tally = Tally::new(layout);
                tally.consume(metric);
                self.tasks.insert(metric.task.clone(), tally);
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        self.total.merge(&other.total);
        for (name, tally) in &other.tasks {
            match self.tasks.get_mut(name) {
                Some(mine) => mine.merge(tally),
                None => {
                    self.tasks.insert(name.clone(), tally.clone());
                }
            }
        }
    }
}

/// Sealed windows and their merge.
#[derive(Debug)]
struct Sealed {
    windows: Vec<Arc<AggregateWindow>>,
    merged: AggregateWindow,
}

pub struct StatsAggregator {
    origin: Instant,
    window: Duration,
    layout: BucketLayout,
    open: Mutex<AggregateWindow>,
    closed: RwLock<Sealed>,
    faults: AtomicU64,
}

impl StatsAggregator {
    /// Start aggregating now. A zero `window` is bumped to one millisecond.
    pub fn new(window: Duration, layout: BucketLayout) -> Self {
        Self {
            origin: Instant::now(),
            window: window.max(Duration::from_millis(1)),
            layout,
            open: Mutex::new(AggregateWindow::new(0, layout)),
            closed: RwLock::new(Sealed {
                windows: Vec::new(),
                merged: AggregateWindow::new(0, layout),
            }),
            faults: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn layout(&self) -> BucketLayout {
        self.layout
    }

    /// Record one execution. Callable from any number of tasks or threads.
    pub fn record(&self, result: ExecutionResult) {
        let index = self.window_index(Instant::now());
        let mut open = self.open.lock();
        self.rotate(&mut open, index);
        open.consume(&result);
    }

    /// Count an internal fault (a panic escaping a task call).
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Sealed, non-empty windows in chronological order.
    pub fn closed_windows(&self) -> Vec<Arc<AggregateWindow>> {
        self.closed.read().windows.clone()
    }

    /// Consistent, merged view of everything recorded so far.
    pub fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        let index = self.window_index(now);
        let (open, mut merged, sealed, last) = {
            let mut open = self.open.lock();
            self.rotate(&mut open, index);
            let closed = self.closed.read();
            let last = closed.windows.last().map(|w| (w.index, w.total.count));
            (open.clone(), closed.merged.clone(), closed.windows.len(), last)
        };

        let recent = last
            .filter(|(i, _)| i + 1 == index)
            .map(|(_, count)| count)
            .unwrap_or(0);
        merged.merge(&open);

        Snapshot {
            elapsed: now.duration_since(self.origin),
            window: self.window,
            windows: sealed + usize::from(!open.is_empty()),
            total: merged.total,
            tasks: merged.tasks,
            recent_count: recent,
            faults: self.faults(),
            users: 0,
        }
    }

    fn window_index(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_nanos() / self.window.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Seal the open window if `index` is past it. Callers hold the open lock.
    fn rotate(&self, open: &mut AggregateWindow, index: u64) {
        if index <= open.index {
            return;
        }
        let sealed = std::mem::replace(open, AggregateWindow::new(index, self.layout));
        if !sealed.is_empty() {
            let mut closed = self.closed.write();
            closed.merged.merge(&sealed);
            closed.windows.push(Arc::new(sealed));
        }
    }
}

/// A merged read of all windows.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Time since the aggregator was created.
    pub elapsed: Duration,
    pub window: Duration,
    /// Number of non-empty windows merged into this snapshot.
    pub windows: usize,
    pub total: Tally,
    pub tasks: BTreeMap<Arc<str>, Tally>,
    /// Results recorded in the last complete window.
    pub recent_count: u64,
    pub faults: u64,
    /// Live virtual users when the snapshot was published.
    pub users: usize,
}

impl Snapshot {
    pub fn empty(layout: BucketLayout) -> Self {
        Self {
            elapsed: Duration::ZERO,
            window: Duration::ZERO,
            windows: 0,
            total: Tally::new(layout),
            tasks: BTreeMap::new(),
            recent_count: 0,
            faults: 0,
            users: 0,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.total.count
    }

    pub fn error_count(&self) -> u64 {
        self.total.error_count()
    }

    pub fn error_rate(&self) -> f64 {
        self.total.error_rate()
    }

    pub fn percentile(&self, percentile: f64) -> Duration {
        self.total.latency.percentile(percentile)
    }

    /// Average results per second since the start.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total.count as f64 / secs
        } else {
            0.0
        }
    }

    /// Results per second over the last complete window.
    pub fn recent_throughput(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 {
            self.recent_count as f64 / secs
        } else {
            0.0
        }
    }

    pub fn task(&self, name: &str) -> Option<&Tally> {
        self.tasks.get(name)
    }
}
