//! Engine configuration.
//!
//! Build it in code with [`EngineConfig::builder`] or load it from YAML with
//! [`EngineConfig::from_file`]. Durations are written in milliseconds in files
//! (fields carry an `_ms` suffix).
//!
//! ```yaml
//! max_users: 50
//! ramp_rate: 5.0
//! stages:
//!   - { duration_ms: 60000, target: 50 }
//!   - { duration_ms: 10000, target: 0 }
//! think_time: { type: uniform, min_ms: 100, max_ms: 500 }
//! histogram: { type: linear, width_ms: 5, buckets: 400 }
//! ```
use std::{path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    controller::Stage,
    error::{Error, Result},
    histogram::{BucketLayout, MAX_LINEAR_BUCKETS},
};

/// Pause a virtual user takes between two consecutive tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkTime {
    #[default]
    None,
    Constant {
        #[serde(rename = "pause_ms", with = "millis")]
        pause: Duration,
    },
    /// Uniformly distributed in `min..=max`.
    Uniform {
        #[serde(rename = "min_ms", with = "millis")]
        min: Duration,
        #[serde(rename = "max_ms", with = "millis")]
        max: Duration,
    },
}

impl ThinkTime {
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        match *self {
            ThinkTime::None => Duration::ZERO,
            ThinkTime::Constant { pause } => pause,
            ThinkTime::Uniform { min, max } if min >= max => min,
            ThinkTime::Uniform { min, max } => rng.gen_range(min..=max),
        }
    }
}

fn default_max_users() -> usize {
    // 120 users per cpu, same ballpark as the worker default of async executors
    num_cpus::get() * 120
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_max_consecutive_faults() -> u32 {
    3
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct EngineConfig {
    /// Hard cap on concurrently live virtual users.
    #[serde(default = "default_max_users")]
    #[builder(default = default_max_users())]
    pub max_users: usize,

    /// Ramp profile, run in order.
    pub stages: Vec<Stage>,

    /// Spawns (or stops) per second while converging on a new target. Unbounded
    /// when unset.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub ramp_rate: Option<f64>,

    #[serde(default)]
    #[builder(default)]
    pub think_time: ThinkTime,

    #[serde(default)]
    #[builder(default)]
    pub histogram: BucketLayout,

    /// Width of one statistics window.
    #[serde(default = "default_window", rename = "window_ms", with = "millis")]
    #[builder(default = default_window())]
    pub window: Duration,

    /// How long shutdown waits for users to finish their current request before
    /// aborting them.
    #[serde(
        default = "default_grace_timeout",
        rename = "grace_timeout_ms",
        with = "millis"
    )]
    #[builder(default = default_grace_timeout())]
    pub grace_timeout: Duration,

    /// Per-request deadline enforced by the executor.
    #[serde(
        default = "default_request_timeout",
        rename = "request_timeout_ms",
        with = "millis::option"
    )]
    #[builder(default = default_request_timeout())]
    pub request_timeout: Option<Duration>,

    /// Global request-rate cap across all users.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub max_rps: Option<f64>,

    /// Consecutive internal faults after which a user gives up and is replaced.
    #[serde(default = "default_max_consecutive_faults")]
    #[builder(default = default_max_consecutive_faults())]
    pub max_consecutive_faults: u32,

    /// Seed for task selection and think-time sampling.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,

    /// Granularity of the pool reconciler and the throttle governor.
    #[serde(default = "default_tick", rename = "tick_ms", with = "millis")]
    #[builder(default = default_tick())]
    pub tick: Duration,

    /// How often live snapshots are published.
    #[serde(
        default = "default_report_interval",
        rename = "report_interval_ms",
        with = "millis"
    )]
    #[builder(default = default_report_interval())]
    pub report_interval: Duration,
}

impl EngineConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::config("at least one stage is required"));
        }
        if self.max_users == 0 {
            return Err(Error::config("max_users must be > 0"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.target > self.max_users {
                return Err(Error::config(format!(
                    "stage {} targets {} users but max_users is {}",
                    i + 1,
                    stage.target,
                    self.max_users
                )));
            }
        }
        check_rate("ramp_rate", self.ramp_rate)?;
        check_rate("max_rps", self.max_rps)?;
        for (name, value) in [
            ("window", self.window),
            ("tick", self.tick),
            ("report_interval", self.report_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be > 0")));
            }
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("request_timeout must be > 0"));
        }
        if let ThinkTime::Uniform { min, max } = self.think_time {
            if min > max {
                return Err(Error::config("think_time min is larger than max"));
            }
        }
        if let BucketLayout::Linear { width, buckets } = self.histogram {
            if width.is_zero() || buckets == 0 {
                return Err(Error::config(
                    "linear histogram needs a non-zero width and bucket count",
                ));
            }
            if buckets > MAX_LINEAR_BUCKETS {
                return Err(Error::config(format!(
                    "linear histogram allows at most {MAX_LINEAR_BUCKETS} buckets, got {buckets}"
                )));
            }
        }
        if self.max_consecutive_faults == 0 {
            return Err(Error::config("max_consecutive_faults must be > 0"));
        }
        Ok(())
    }
}

fn check_rate(name: &str, rate: Option<f64>) -> Result<()> {
    match rate {
        Some(r) if r.is_nan() || r <= 0.0 => {
            Err(Error::config(format!("{name} must be a positive number")))
        }
        _ => Ok(()),
    }
}

/// `Duration` <-> integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
        }
    }
}
