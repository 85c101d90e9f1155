//! UserPool: keeps the number of live virtual users at a target.
//!
//! A single reconciler task owns every user. It wakes up on each `tick` and
//! whenever the target changes, reaps users that ended, spawns users while the
//! pool is below target (paced by the ramp rate, if any) and retires the newest
//! users while it is above. Retired users finish their current iteration before
//! they leave; they still count towards the population until they do.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    error::Result,
    metric::ExecutionResult,
    stats::StatsAggregator,
    task::Task,
    throttle::{MAX_TOKENS, calc_token_limit},
    user::{UserContext, UserExit, UserShared, UserState, VirtualUser},
};

/// Knobs of the reconciler.
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    /// Hard cap on live users, retiring ones included.
    pub max_users: usize,
    /// Users started per second. `None` starts the whole deficit at once.
    pub ramp_rate: Option<f64>,
    pub tick: Duration,
}

/// What happened to the users during [`UserPool::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Users that observed the stop signal within the grace period.
    pub stopped: usize,
    /// Users that were still busy at the deadline and got aborted.
    pub aborted: usize,
    /// Requests discarded by the aborts, recorded as cancelled.
    pub cancelled_requests: usize,
}

pub struct UserPool {
    target: watch::Sender<usize>,
    population: watch::Receiver<usize>,
    shutdown: watch::Sender<Option<Duration>>,
    reconciler: JoinHandle<ShutdownReport>,
    max_users: usize,
}

impl UserPool {
    /// Start an empty pool. Nothing runs until [`UserPool::set_target`] is called.
    pub fn spawn<T: Task>(ctx: UserContext<T>, settings: PoolSettings) -> Self {
        let (target_tx, target_rx) = watch::channel(0);
        let (population_tx, population_rx) = watch::channel(0);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);

        let reconciler = tokio::spawn(reconciler_task(
            ctx,
            settings,
            target_rx,
            population_tx,
            shutdown_rx,
        ));

        Self {
            target: target_tx,
            population: population_rx,
            shutdown: shutdown_tx,
            reconciler,
            max_users: settings.max_users,
        }
    }

    /// Ask for `users` live users. The value is clamped to `max_users` and the
    /// applied target is returned.
    pub fn set_target(&self, users: usize) -> usize {
        let applied = users.min(self.max_users);
        if applied < users {
            tracing::warn!(
                "Requested {users} users but the pool is capped at {}.",
                self.max_users
            );
        }
        self.target.send_replace(applied);
        applied
    }

    pub fn target(&self) -> usize {
        *self.target.borrow()
    }

    pub fn max_users(&self) -> usize {
        self.max_users
    }

    /// Users currently alive, including the ones retiring.
    pub fn population(&self) -> usize {
        *self.population.borrow()
    }

    pub fn watch_population(&self) -> watch::Receiver<usize> {
        self.population.clone()
    }

    /// Stop every user. Users get `grace` to finish their current request, the
    /// rest are aborted and their requests recorded as cancelled.
    pub async fn shutdown(self, grace: Duration) -> Result<ShutdownReport> {
        self.shutdown.send_replace(Some(grace));
        let report = self.reconciler.await?;
        tracing::info!(
            "User pool drained: {} stopped, {} aborted, {} requests cancelled.",
            report.stopped,
            report.aborted,
            report.cancelled_requests
        );
        Ok(report)
    }
}

use internals::*;

mod internals {
    use super::*;

    pub struct Member {
        pub id: usize,
        pub stop: watch::Sender<bool>,
        pub shared: Arc<UserShared>,
        pub handle: JoinHandle<UserExit>,
    }

    pub fn spawn_user<T: Task>(id: usize, ctx: &UserContext<T>) -> Member {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(UserShared::new());
        let user = VirtualUser::new(id, ctx.clone(), stop_rx, shared.clone());
        Member {
            id,
            stop: stop_tx,
            shared,
            handle: tokio::spawn(user.run()),
        }
    }

    /// Remove the members whose task ended. Returns how many active users
    /// faulted out.
    pub async fn reap(members: &mut Vec<Member>, stats: &StatsAggregator) -> usize {
        let mut faulted = 0;
        let mut i = 0;
        while i < members.len() {
            if !members[i].handle.is_finished() {
                i += 1;
                continue;
            }
            let member = members.remove(i);
            match member.handle.await {
                Ok(UserExit::Stopped) => {}
                Ok(UserExit::Faulted) => {
                    tracing::warn!("User {} faulted out, replacing it.", member.id);
                    faulted += 1;
                }
                Err(e) => {
                    stats.record_fault();
                    tracing::error!("User {} crashed: {e}", member.id);
                    faulted += 1;
                }
            }
        }
        faulted
    }

    /// Ramp pacing state, shared by spawns and retirements. Tokens are only
    /// earned while the pool is off target; a settled pool starts its next ramp
    /// with one user right away.
    pub struct Ramp {
        rate: Option<f64>,
        fractional: f64,
        last: Instant,
    }

    impl Ramp {
        pub fn new(rate: Option<f64>) -> Self {
            Self {
                rate,
                fractional: 1.0,
                last: Instant::now(),
            }
        }

        pub fn budget(&mut self, now: Instant) -> usize {
            let elapsed = now.saturating_duration_since(self.last);
            self.last = now;
            match self.rate {
                None => MAX_TOKENS,
                Some(rate) => {
                    let (tokens, fractional) = calc_token_limit(rate, elapsed, self.fractional);
                    self.fractional = fractional;
                    tokens
                }
            }
        }

        pub fn idle(&mut self, now: Instant) {
            self.last = now;
            self.fractional = 1.0;
        }
    }

    pub async fn reconciler_task<T: Task>(
        ctx: UserContext<T>,
        settings: PoolSettings,
        mut target: watch::Receiver<usize>,
        population: watch::Sender<usize>,
        mut shutdown: watch::Receiver<Option<Duration>>,
    ) -> ShutdownReport {
        let stats = ctx.stats().clone();
        let mut active: Vec<Member> = Vec::new();
        let mut retiring: Vec<Member> = Vec::new();
        let mut next_id = 0;
        let mut ramp = Ramp::new(settings.ramp_rate);

        let mut ticker = tokio::time::interval(settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(?settings, "Reconciler started.");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = target.changed() => {
                    // the pool handle was dropped without a shutdown
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            let replacements = reap(&mut active, &stats).await;
            reap(&mut retiring, &stats).await;

            let desired = (*target.borrow_and_update()).min(settings.max_users);
            let now = Instant::now();
            let live = active.len();
            if desired == live {
                ramp.idle(now);
            } else if desired > live {
                let room = settings
                    .max_users
                    .saturating_sub(live + retiring.len());
                let budget = ramp.budget(now).saturating_add(replacements);
                let spawn = (desired - live).min(room).min(budget);
                for _ in 0..spawn {
                    active.push(spawn_user(next_id, &ctx));
                    next_id += 1;
                }
                if spawn > 0 {
                    tracing::debug!("Spawned {spawn} users ({} active).", active.len());
                }
            } else {
                let retire = (live - desired).min(ramp.budget(now));
                // newest first
                for member in active.drain(live - retire..).rev() {
                    member.stop.send_replace(true);
                    retiring.push(member);
                }
                if retire > 0 {
                    tracing::debug!("Retiring {retire} users ({} active).", active.len());
                }
            }

            population.send_replace(active.len() + retiring.len());
        }

        let grace = (*shutdown.borrow()).unwrap_or(Duration::ZERO);
        retiring.append(&mut active);
        let report = drain(retiring, grace, &stats).await;
        population.send_replace(0);
        report
    }

    /// Stop all members and wait for them until `grace` runs out.
    pub async fn drain(
        members: Vec<Member>,
        grace: Duration,
        stats: &StatsAggregator,
    ) -> ShutdownReport {
        for member in &members {
            member.stop.send_replace(true);
        }
        tracing::info!(
            "Stopping {} users, grace period {grace:?}.",
            members.len()
        );

        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for mut member in members {
            match tokio::time::timeout_at(deadline, &mut member.handle).await {
                Ok(_) => report.stopped += 1,
                Err(_) => {
                    tracing::warn!(
                        "User {} did not stop within the grace period, aborting it.",
                        member.id
                    );
                    member.handle.abort();
                    let _ = member.handle.await;
                    member.shared.set_state(UserState::Stopped);
                    report.aborted += 1;
                    if let Some(in_flight) = member.shared.take_in_flight() {
                        stats.record(ExecutionResult::cancelled(
                            in_flight.task,
                            in_flight.started,
                        ));
                        report.cancelled_requests += 1;
                    }
                }
            }
        }
        report
    }
}
