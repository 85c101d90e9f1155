//! Virtual users: sequential actors that pick a task, run it, record the result
//! and pause, until told to stop.
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use futures::FutureExt;
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{sync::watch, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    config::ThinkTime,
    executor::RequestExecutor,
    stats::StatsAggregator,
    task::{Task, TaskPicker, TaskSet},
    throttle::Throttle,
};

/// Offset between the task-selection seed and the think-time seed of a user.
const PACING_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserState {
    Spawning = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl UserState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => UserState::Spawning,
            1 => UserState::Running,
            2 => UserState::Stopping,
            _ => UserState::Stopped,
        }
    }
}

/// Why a user's loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserExit {
    /// The stop signal was observed.
    Stopped,
    /// Too many consecutive internal faults; the pool replaces the user.
    Faulted,
}

/// Request that was running when the user was last observed.
#[derive(Clone, Debug)]
pub(crate) struct InFlight {
    pub task: Arc<str>,
    pub started: Instant,
}

/// State a user shares with the pool that owns it.
#[derive(Debug)]
pub(crate) struct UserShared {
    state: AtomicU8,
    in_flight: Mutex<Option<InFlight>>,
}

impl UserShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UserState::Spawning as u8),
            in_flight: Mutex::new(None),
        }
    }

    pub fn state(&self) -> UserState {
        UserState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: UserState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn take_in_flight(&self) -> Option<InFlight> {
        self.in_flight.lock().take()
    }
}

/// Everything the users of one run have in common.
#[derive(TypedBuilder)]
pub struct UserContext<T: Task> {
    tasks: Arc<TaskSet<T>>,
    stats: Arc<StatsAggregator>,
    #[builder(default)]
    executor: RequestExecutor,
    #[builder(default)]
    think_time: ThinkTime,
    #[builder(default)]
    throttle: Option<Throttle>,
    #[builder(default = 3)]
    max_consecutive_faults: u32,
    #[builder(default)]
    seed: Option<u64>,
}

impl<T: Task> Clone for UserContext<T> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            stats: self.stats.clone(),
            executor: self.executor,
            think_time: self.think_time,
            throttle: self.throttle.clone(),
            max_consecutive_faults: self.max_consecutive_faults,
            seed: self.seed,
        }
    }
}

impl<T: Task> UserContext<T> {
    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }
}

pub struct VirtualUser<T: Task> {
    id: usize,
    ctx: UserContext<T>,
    picker: TaskPicker,
    pacing: StdRng,
    stop: watch::Receiver<bool>,
    shared: Arc<UserShared>,
}

impl<T: Task> VirtualUser<T> {
    pub(crate) fn new(
        id: usize,
        ctx: UserContext<T>,
        stop: watch::Receiver<bool>,
        shared: Arc<UserShared>,
    ) -> Self {
        let seed = ctx.seed.map(|s| s.wrapping_add(id as u64));
        let picker = ctx.tasks.picker(seed);
        let pacing = match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ PACING_SEED_SALT),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            ctx,
            picker,
            pacing,
            stop,
            shared,
        }
    }

    /// Run until the stop signal is raised or the user faults out.
    ///
    /// The signal is only acted on between iterations: a request that already
    /// started always completes and is recorded, with the user reporting
    /// [`UserState::Stopping`] until it does.
    pub async fn run(mut self) -> UserExit {
        let tasks = self.ctx.tasks.clone();
        let stats = self.ctx.stats.clone();
        let executor = self.ctx.executor;

        if !run_hooks(Hook::Start, self.id, &tasks, &stats).await {
            tracing::warn!("User {} failed to start.", self.id);
            self.shared.set_state(UserState::Stopped);
            return UserExit::Faulted;
        }
        self.shared.set_state(UserState::Running);
        tracing::debug!("User {} started.", self.id);

        let mut consecutive_faults = 0;
        let mut stopping = false;

        let exit = loop {
            if *self.stop.borrow() {
                break UserExit::Stopped;
            }

            if let Some(throttle) = &self.ctx.throttle {
                tokio::select! {
                    biased;
                    _ = self.stop.wait_for(|s| *s) => break UserExit::Stopped,
                    granted = throttle.acquire() => {
                        if !granted {
                            break UserExit::Stopped;
                        }
                    }
                }
            }

            let Some(entry) = tasks.get(self.picker.pick()) else {
                break UserExit::Faulted;
            };
            *self.shared.in_flight.lock() = Some(InFlight {
                task: entry.name().clone(),
                started: Instant::now(),
            });
            let call = AssertUnwindSafe(executor.execute(entry)).catch_unwind();
            tokio::pin!(call);
            let attempt = loop {
                tokio::select! {
                    attempt = &mut call => break attempt,
                    // never cancels the call, only flags the state
                    Ok(_) = self.stop.wait_for(|s| *s), if !stopping => {
                        stopping = true;
                        self.shared.set_state(UserState::Stopping);
                    }
                }
            };
            self.shared.take_in_flight();

            match attempt {
                Ok(result) => {
                    consecutive_faults = 0;
                    stats.record(result);
                }
                Err(panic) => {
                    consecutive_faults += 1;
                    stats.record_fault();
                    tracing::error!(
                        "User {} faulted in task {} ({consecutive_faults} in a row): {}",
                        self.id,
                        entry.name(),
                        panic_message(panic.as_ref())
                    );
                    if consecutive_faults >= self.ctx.max_consecutive_faults {
                        break UserExit::Faulted;
                    }
                }
            }

            let pause = self.ctx.think_time.sample(&mut self.pacing);
            if pause.is_zero() {
                // Small yield to prevent a tight loop on instant tasks
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = self.stop.wait_for(|s| *s) => break UserExit::Stopped,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        };

        self.shared.set_state(UserState::Stopping);
        tracing::debug!("User {} shutting down ({exit:?}).", self.id);
        run_hooks(Hook::Stop, self.id, &tasks, &stats).await;
        self.shared.set_state(UserState::Stopped);
        exit
    }
}

#[derive(Clone, Copy, Debug)]
enum Hook {
    Start,
    Stop,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::Start => "on_start",
            Hook::Stop => "on_stop",
        }
    }
}

/// Run `hook` of every task for `user`. A panicking hook counts as a fault;
/// returns `false` if any did.
async fn run_hooks<T: Task>(
    hook: Hook,
    user: usize,
    tasks: &TaskSet<T>,
    stats: &StatsAggregator,
) -> bool {
    let mut clean = true;
    for entry in tasks.entries() {
        let task = entry.task();
        let outcome = AssertUnwindSafe(async {
            match hook {
                Hook::Start => task.on_start(user).await,
                Hook::Stop => task.on_stop(user).await,
            }
        })
        .catch_unwind()
        .await;
        if let Err(panic) = outcome {
            clean = false;
            stats.record_fault();
            tracing::error!(
                "User {user} faulted in {} of task {}: {}",
                hook.name(),
                entry.name(),
                panic_message(panic.as_ref())
            );
        }
    }
    clean
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        histogram::BucketLayout,
        task::{Reply, TaskError},
    };

    struct Counting {
        calls: Arc<AtomicUsize>,
        latency: Duration,
        panics: bool,
    }

    impl Task for Counting {
        async fn call(&self) -> Result<Reply, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if self.panics {
                panic!("boom");
            }
            Ok(Reply::new(200, 1))
        }
    }

    fn context(task: Counting, think_time: ThinkTime) -> UserContext<Counting> {
        let tasks = TaskSet::builder().task("count", task).build().unwrap();
        UserContext::builder()
            .tasks(Arc::new(tasks))
            .stats(Arc::new(StatsAggregator::new(
                Duration::from_secs(1),
                BucketLayout::PowerOfTwo,
            )))
            .think_time(think_time)
            .max_consecutive_faults(2)
            .seed(Some(1))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_stopped_and_records_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = context(
            Counting {
                calls: calls.clone(),
                latency: Duration::from_millis(100),
                panics: false,
            },
            ThinkTime::Constant {
                pause: Duration::from_millis(100),
            },
        );
        let stats = ctx.stats().clone();
        let shared = Arc::new(UserShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        assert_eq!(shared.state(), UserState::Spawning);

        let handle = tokio::spawn(VirtualUser::new(0, ctx, stop_rx, shared.clone()).run());
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(shared.state(), UserState::Running);

        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), UserExit::Stopped);
        assert_eq!(shared.state(), UserState::Stopped);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_count(), calls.load(Ordering::SeqCst) as u64);
        assert!(snapshot.total_count() >= 5);
        assert_eq!(snapshot.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_never_interrupts_a_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = context(
            Counting {
                calls: calls.clone(),
                latency: Duration::from_secs(5),
                panics: false,
            },
            ThinkTime::None,
        );
        let stats = ctx.stats().clone();
        let shared = Arc::new(UserShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(VirtualUser::new(0, ctx, stop_rx, shared.clone()).run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(true).unwrap();
        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(shared.state(), UserState::Stopping);
        assert!(shared.in_flight.lock().is_some());

        assert_eq!(handle.await.unwrap(), UserExit::Stopped);
        assert_eq!(shared.state(), UserState::Stopped);

        // the in-flight call ran to completion and was recorded
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_count(), 1);
        assert_eq!(snapshot.total.errors.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_faults_end_the_user() {
        let ctx = context(
            Counting {
                calls: Arc::new(AtomicUsize::new(0)),
                latency: Duration::from_millis(10),
                panics: true,
            },
            ThinkTime::None,
        );
        let stats = ctx.stats().clone();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = VirtualUser::new(0, ctx, stop_rx, Arc::new(UserShared::new()))
            .run()
            .await;

        assert_eq!(exit, UserExit::Faulted);
        assert_eq!(stats.faults(), 2);
        assert_eq!(stats.snapshot().total_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_gates_requests() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (throttle, _governor) =
            Throttle::spawn(10.0, Duration::from_millis(100), shutdown_rx);
        let tasks = TaskSet::builder()
            .task(
                "count",
                Counting {
                    calls: calls.clone(),
                    latency: Duration::ZERO,
                    panics: false,
                },
            )
            .build()
            .unwrap();
        let ctx = UserContext::builder()
            .tasks(Arc::new(tasks))
            .stats(Arc::new(StatsAggregator::new(
                Duration::from_secs(1),
                BucketLayout::PowerOfTwo,
            )))
            .throttle(Some(throttle))
            .build();
        let stats = ctx.stats().clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            VirtualUser::new(0, ctx, stop_rx, Arc::new(UserShared::new())).run(),
        );

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), UserExit::Stopped);
        shutdown_tx.send(true).unwrap();

        let recorded = stats.snapshot().total_count();
        assert!((19..=22).contains(&recorded), "{recorded}");
        assert!(
            stats
                .closed_windows()
                .iter()
                .all(|w| w.total().count <= 11)
        );
        assert_eq!(
            stats.snapshot().task("count").map(|t| t.count),
            Some(recorded)
        );
    }

    /// Counts hook calls and requests made before every `on_start` finished.
    #[derive(Clone, Default)]
    struct Hooked {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        early_calls: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl Task for Hooked {
        async fn call(&self) -> Result<Reply, TaskError> {
            if self.starts.load(Ordering::SeqCst) < 2 {
                self.early_calls.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Reply::new(200, 1))
        }

        async fn on_start(&self, _user: usize) {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if self.fail_start {
                panic!("login failed");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_stop(&self, _user: usize) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hooked_context(task: Hooked) -> UserContext<Hooked> {
        let tasks = TaskSet::builder()
            .task("browse", task.clone())
            .task("search", task)
            .build()
            .unwrap();
        UserContext::builder()
            .tasks(Arc::new(tasks))
            .stats(Arc::new(StatsAggregator::new(
                Duration::from_secs(1),
                BucketLayout::PowerOfTwo,
            )))
            .seed(Some(1))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_bracket_the_request_loop() {
        let task = Hooked::default();
        let ctx = hooked_context(task.clone());
        let stats = ctx.stats().clone();
        let shared = Arc::new(UserShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(VirtualUser::new(7, ctx, stop_rx, shared.clone()).run());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(shared.state(), UserState::Spawning);
        assert_eq!(stats.snapshot().total_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(shared.state(), UserState::Running);
        assert_eq!(task.starts.load(Ordering::SeqCst), 2);
        assert_eq!(task.stops.load(Ordering::SeqCst), 0);

        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), UserExit::Stopped);
        assert_eq!(task.stops.load(Ordering::SeqCst), 2);
        assert_eq!(task.early_calls.load(Ordering::SeqCst), 0);
        assert!(stats.snapshot().total_count() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_on_start_faults_the_user() {
        let task = Hooked {
            fail_start: true,
            ..Hooked::default()
        };
        let ctx = hooked_context(task.clone());
        let stats = ctx.stats().clone();
        let shared = Arc::new(UserShared::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let exit = VirtualUser::new(0, ctx, stop_rx, shared.clone()).run().await;

        assert_eq!(exit, UserExit::Faulted);
        assert_eq!(shared.state(), UserState::Stopped);
        assert_eq!(stats.faults(), 2);
        assert_eq!(stats.snapshot().total_count(), 0);
        assert_eq!(task.stops.load(Ordering::SeqCst), 0);
    }
}
