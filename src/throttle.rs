//! Global request-rate shaping.
//!
//! A [`Throttle`] is a token bucket implemented with a [`tokio::sync::Semaphore`].
//! A governor task adds permits every `tick` according to the configured rate and
//! virtual users "forget" one permit per request, so the bucket only ever refills
//! through the governor.
//!
//! # Mathematical behavior of the governor
//! The governor computes how many tokens a span of `elapsed` time is worth:
//!
//! ```text
//! add_f = rate * elapsed_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! Carrying the fractional part spreads a continuous rate over discrete tokens
//! while preserving the long-term average (2.5 rps at a 100ms tick adds one token
//! on every fourth tick). The same arithmetic paces the user pool's ramp.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
    time::Instant,
};

#[cfg(feature = "internals")]
pub use internals::*;
#[cfg(not(feature = "internals"))]
pub(crate) use internals::*;

/// Shared token bucket gating every request of a run.
#[derive(Clone, Debug)]
pub struct Throttle {
    permits: Arc<Semaphore>,
    rate: f64,
}

impl Throttle {
    /// Start a governor adding `rate` tokens per second until `shutdown` flips to
    /// `true`. The bucket holds at most one second worth of tokens.
    pub fn spawn(
        rate: f64,
        tick: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let permits = Arc::new(Semaphore::new(0));
        let capacity = (rate.ceil() as usize).clamp(1, MAX_TOKENS);
        let governor = tokio::spawn(token_governor_task(
            permits.clone(),
            rate,
            tick,
            capacity,
            shutdown,
        ));
        (Self { permits, rate }, governor)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wait for a token. Returns `false` once the throttle has been closed.
    pub async fn acquire(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                // The governor is solely responsible for adding permits.
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wake every waiter; later `acquire` calls return `false` immediately.
    pub fn close(&self) {
        self.permits.close();
    }
}

mod internals {
    use super::*;

    /// The semaphore implementation uses 3 bits of usize for flags.
    /// Any value greater than this will be capped to avoid crashing
    /// the whole thing.
    pub const MAX_TOKENS: usize = usize::MAX >> 3;

    /// Governor task that adds tokens to the shared semaphore at a constant rate.
    pub async fn token_governor_task(
        permits: Arc<Semaphore>,
        rate: f64,
        tick: Duration,
        bucket_capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let main_task = async {
            let mut fractional = 0.0;
            let mut next_tick = Instant::now();
            tracing::debug!(rate, ?tick, "Governor task started.");

            loop {
                next_tick += tick;
                let (add_total, f) = calc_token_limit(rate, tick, fractional);
                fractional = f;

                if add_total > 0 {
                    let avail = permits.available_permits();
                    if avail < bucket_capacity {
                        // Only add tokens up to the bucket capacity
                        let add = add_total.min(bucket_capacity - avail);
                        if add > 0 {
                            permits.add_permits(add);
                        }
                    }
                }
                tokio::time::sleep_until(next_tick).await;
            }
        };

        tokio::select! {
            _ = main_task => {}
            _ = shutdown.wait_for(|b| *b) => {
                tracing::debug!("Governor received shutdown signal.");
            }
        };
        permits.close();
    }

    /// Pure function to calculate how many tokens `elapsed` time is worth at
    /// `rate` tokens per second, carrying the fractional part across calls.
    ///
    /// Returns `(tokens_to_add, next_fractional_part)`.
    pub fn calc_token_limit(rate: f64, elapsed: Duration, fractional: f64) -> (usize, f64) {
        if rate.is_nan() || rate <= 0.0 {
            return (0, 0.0);
        }
        if rate.is_infinite() {
            return (MAX_TOKENS, 0.0);
        }
        let add_f = rate * elapsed.as_secs_f64();
        let add_total_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - add_total_f;

        // Safely convert f64 to usize, saturating at the semaphore's hard limit
        // to prevent panics.
        if add_total_f >= MAX_TOKENS as f64 {
            (MAX_TOKENS, 0.0)
        } else {
            (add_total_f as usize, fractional)
        }
    }
}
