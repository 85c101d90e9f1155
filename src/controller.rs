//! Controller: walks through the configured stages, drives the user pool and
//! publishes live snapshots until the schedule ends or a stop is requested.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::{EngineConfig, millis},
    error::Result,
    executor::RequestExecutor,
    pool::{PoolSettings, ShutdownReport, UserPool},
    report::{LogReporter, Reporter, SummaryReport},
    stats::{Snapshot, StatsAggregator},
    task::{Task, TaskSet},
    throttle::Throttle,
    user::UserContext,
};

/// A stage holds `target` virtual users for `duration`.
///
/// Use `Stage::new(Duration::from_secs(60), 50)` to run 50 users for a minute.
/// The target applies as soon as the stage starts; how fast the pool gets
/// there depends on the ramp rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Number of virtual users
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Cloneable handle that ends a run early. The shutdown path is the same as
/// when the schedule runs out.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Outcome of [`Controller::run`].
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Final merged statistics, taken after every user has stopped.
    pub snapshot: Snapshot,
    pub shutdown: ShutdownReport,
    pub stopped_early: bool,
    pub stages_completed: usize,
}

pub struct Controller<T: Task> {
    config: EngineConfig,
    tasks: Arc<TaskSet<T>>,
    stop: Arc<watch::Sender<bool>>,
    snapshots: Arc<watch::Sender<Snapshot>>,
}

impl<T: Task> Controller<T> {
    pub fn new(config: EngineConfig, tasks: TaskSet<T>) -> Result<Self> {
        config.validate()?;
        let (stop, _) = watch::channel(false);
        let (snapshots, _) = watch::channel(Snapshot::empty(config.histogram));
        Ok(Self {
            config,
            tasks: Arc::new(tasks),
            stop: Arc::new(stop),
            snapshots: Arc::new(snapshots),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Receiver of the snapshots published every `report_interval`.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub async fn run(self) -> Result<RunSummary> {
        let config = &self.config;
        let stats = Arc::new(StatsAggregator::new(config.window, config.histogram));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (throttle, governor) = match config.max_rps {
            Some(rate) => {
                tracing::info!("Spawning throttle at {rate} requests/s...");
                let (throttle, governor) = Throttle::spawn(rate, config.tick, shutdown_rx.clone());
                (Some(throttle), Some(governor))
            }
            None => (None, None),
        };

        let ctx = UserContext::builder()
            .tasks(self.tasks.clone())
            .stats(stats.clone())
            .executor(RequestExecutor::new(config.request_timeout))
            .think_time(config.think_time)
            .throttle(throttle.clone())
            .max_consecutive_faults(config.max_consecutive_faults)
            .seed(config.seed)
            .build();

        tracing::info!("Spawning user pool (max {} users)...", config.max_users);
        let pool = UserPool::spawn(
            ctx,
            PoolSettings {
                max_users: config.max_users,
                ramp_rate: config.ramp_rate,
                tick: config.tick,
            },
        );

        let publisher = spawn_publisher(
            stats.clone(),
            pool.watch_population(),
            self.snapshots.clone(),
            config.report_interval,
            shutdown_rx,
        );

        tracing::info!("Running now!");
        let mut stop = self.stop.subscribe();
        let mut stopped_early = false;
        let mut stages_completed = 0;
        for (i, stage) in config.stages.iter().enumerate() {
            if *stop.borrow_and_update() {
                stopped_early = true;
                break;
            }
            let target = pool.set_target(stage.target);
            tracing::info!(
                "Stage {}/{}: {target} users for {:?}.",
                i + 1,
                config.stages.len(),
                stage.duration
            );
            tokio::select! {
                _ = tokio::time::sleep(stage.duration) => stages_completed += 1,
                _ = stop.wait_for(|s| *s) => {
                    tracing::info!("Stop requested during stage {}.", i + 1);
                    stopped_early = true;
                    break;
                }
            }
        }

        let shutdown = pool.shutdown(config.grace_timeout).await?;
        shutdown_tx.send_replace(true);
        if let Some(throttle) = &throttle {
            throttle.close();
        }
        if let Some(governor) = governor {
            governor.await?;
        }
        publisher.await?;

        let snapshot = stats.snapshot();
        self.snapshots.send_replace(snapshot.clone());
        if let Err(e) = LogReporter.report(&SummaryReport::from(&snapshot)).await {
            tracing::warn!("Could not report final summary: {e}");
        }
        tracing::info!(
            "Done: {stages_completed}/{} stages completed.",
            config.stages.len()
        );

        Ok(RunSummary {
            snapshot,
            shutdown,
            stopped_early,
            stages_completed,
        })
    }
}

fn spawn_publisher(
    stats: Arc<StatsAggregator>,
    population: watch::Receiver<usize>,
    snapshots: Arc<watch::Sender<Snapshot>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let main_task = async {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut snapshot = stats.snapshot();
                snapshot.users = *population.borrow();
                if let Err(e) = LogReporter.report(&SummaryReport::from(&snapshot)).await {
                    tracing::warn!("Could not report snapshot: {e}");
                }
                snapshots.send_replace(snapshot);
            }
        };

        tokio::select! {
            _ = main_task => {}
            _ = shutdown.wait_for(|b| *b) => {}
        };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Reply, TaskError};

    struct Fixed(u16);

    impl Task for Fixed {
        async fn call(&self) -> std::result::Result<Reply, TaskError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Reply::new(self.0, 32))
        }
    }

    fn config(stages: Vec<Stage>) -> EngineConfig {
        EngineConfig::builder()
            .max_users(10)
            .stages(stages)
            .seed(3)
            .build()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let tasks = TaskSet::builder().task("ok", Fixed(200)).build().unwrap();
        let result = Controller::new(config(vec![Stage::new(Duration::from_secs(1), 11)]), tasks);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_snapshots_while_running() {
        let tasks = TaskSet::builder().task("ok", Fixed(200)).build().unwrap();
        let controller =
            Controller::new(config(vec![Stage::new(Duration::from_secs(5), 2)]), tasks).unwrap();
        let mut snapshots = controller.snapshots();
        let run = tokio::spawn(controller.run());

        snapshots.changed().await.unwrap();
        let live = snapshots.borrow_and_update().clone();
        assert_eq!(live.users, 2);
        assert!(live.total_count() > 0);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.stages_completed, 1);
        assert!(!summary.stopped_early);
        assert_eq!(summary.snapshot.users, 0);
        assert_eq!(snapshots.borrow().total_count(), summary.snapshot.total_count());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_ends_the_run() {
        let tasks = TaskSet::builder().task("ok", Fixed(200)).build().unwrap();
        let controller =
            Controller::new(config(vec![Stage::new(Duration::from_secs(600), 3)]), tasks).unwrap();
        let stop = controller.stop_handle();
        let run = tokio::spawn(controller.run());

        tokio::time::sleep(Duration::from_secs(2)).await;
        stop.stop();
        assert!(stop.is_stopped());

        let summary = run.await.unwrap().unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.stages_completed, 0);
        assert_eq!(summary.shutdown.aborted, 0);
        assert!(summary.snapshot.total_count() > 0);
        assert!(summary.snapshot.elapsed < Duration::from_secs(3));
    }
}
