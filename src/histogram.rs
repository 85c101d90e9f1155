//! Fixed-bucket latency histogram.
//!
//! Recording is O(1): a latency is mapped to a bucket index and a counter is bumped.
//! Percentiles are answered by walking the cumulative counts and reporting the
//! upper bound of the bucket that contains the requested rank, clamped to the
//! observed min/max. The estimate is therefore never below the true value by more
//! than one bucket width, and it is monotonic in the percentile rank.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{aggregate::Aggregate, config::millis};

/// Number of power-of-two buckets: bucket 0 holds 0µs, bucket `i` holds
/// `[2^(i-1), 2^i)` µs.
const POW2_BUCKETS: usize = 65;

/// Largest accepted `buckets` for [`BucketLayout::Linear`]. Larger values are
/// rejected by config validation and clamped here.
pub const MAX_LINEAR_BUCKETS: usize = 1_000_000;

/// How latencies are mapped to buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketLayout {
    /// Exponential buckets over microseconds. Covers any latency with 65 counters;
    /// relative error is at most 2x.
    #[default]
    PowerOfTwo,
    /// `buckets` buckets of equal `width`, plus one overflow bucket for anything
    /// beyond `width * buckets`.
    Linear {
        #[serde(rename = "width_ms", with = "millis")]
        width: Duration,
        buckets: usize,
    },
}

impl BucketLayout {
    /// Total number of counters, overflow bucket included.
    pub fn bucket_count(&self) -> usize {
        match self {
            BucketLayout::PowerOfTwo => POW2_BUCKETS,
            BucketLayout::Linear { buckets, .. } => linear_buckets(*buckets) + 1,
        }
    }

    pub fn index_of(&self, micros: u64) -> usize {
        match self {
            BucketLayout::PowerOfTwo => (u64::BITS - micros.leading_zeros()) as usize,
            BucketLayout::Linear { width, buckets } => {
                let width = width_micros(*width);
                usize::try_from(micros / width)
                    .unwrap_or(usize::MAX)
                    .min(linear_buckets(*buckets))
            }
        }
    }

    /// Largest latency (inclusive, in µs) that falls in bucket `index`.
    pub fn upper_bound(&self, index: usize) -> u64 {
        match self {
            BucketLayout::PowerOfTwo => match index {
                0 => 0,
                i if i >= u64::BITS as usize => u64::MAX,
                i => (1u64 << i) - 1,
            },
            BucketLayout::Linear { width, buckets } => {
                if index >= linear_buckets(*buckets) {
                    u64::MAX
                } else {
                    (index as u64 + 1)
                        .saturating_mul(width_micros(*width))
                        .saturating_sub(1)
                }
            }
        }
    }
}

fn linear_buckets(buckets: usize) -> usize {
    buckets.min(MAX_LINEAR_BUCKETS)
}

fn width_micros(width: Duration) -> u64 {
    u64::try_from(width.as_micros()).unwrap_or(u64::MAX).max(1)
}

fn as_micros(latency: Duration) -> u64 {
    u64::try_from(latency.as_micros()).unwrap_or(u64::MAX)
}

#[derive(Clone, Debug, PartialEq)]
pub struct LatencyHistogram {
    layout: BucketLayout,
    counts: Vec<u64>,
    total: u64,
    sum_micros: u128,
    min_micros: u64,
    max_micros: u64,
}

impl LatencyHistogram {
    pub fn new(layout: BucketLayout) -> Self {
        Self {
            layout,
            counts: vec![0; layout.bucket_count()],
            total: 0,
            sum_micros: 0,
            min_micros: u64::MAX,
            max_micros: 0,
        }
    }

    pub fn layout(&self) -> BucketLayout {
        self.layout
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = as_micros(latency);
        self.counts[self.layout.index_of(micros)] += 1;
        self.total += 1;
        self.sum_micros += u128::from(micros);
        self.min_micros = self.min_micros.min(micros);
        self.max_micros = self.max_micros.max(micros);
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn min(&self) -> Duration {
        if self.is_empty() {
            Duration::ZERO
        } else {
            Duration::from_micros(self.min_micros)
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros)
    }

    /// Exact mean (the sum is tracked outside the buckets).
    pub fn mean(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        let mean = self.sum_micros / u128::from(self.total);
        Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX))
    }

    /// Estimated latency at `percentile` (0..=100). Zero when empty.
    pub fn percentile(&self, percentile: f64) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        let q = if percentile.is_nan() {
            0.0
        } else {
            percentile.clamp(0.0, 100.0)
        };
        let rank = ((q / 100.0) * self.total as f64).ceil() as u64;
        let rank = rank.clamp(1, self.total);

        let mut seen = 0;
        for (index, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let bound = self
                    .layout
                    .upper_bound(index)
                    .clamp(self.min_micros, self.max_micros);
                return Duration::from_micros(bound);
            }
        }
        self.max()
    }
}

impl Aggregate for LatencyHistogram {
    type Metric = Duration;

    fn consume(&mut self, metric: &Self::Metric) {
        self.record(*metric);
    }

    fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.layout == other.layout {
            for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
                *mine += theirs;
            }
        } else {
            // re-bucket by the other side's upper bounds
            for (index, count) in other.counts.iter().enumerate() {
                if *count > 0 {
                    let value = other.layout.upper_bound(index).min(other.max_micros);
                    self.counts[self.layout.index_of(value)] += count;
                }
            }
        }
        self.total += other.total;
        self.sum_micros += other.sum_micros;
        self.min_micros = self.min_micros.min(other.min_micros);
        self.max_micros = self.max_micros.max(other.max_micros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn power_of_two_indices() {
        let layout = BucketLayout::PowerOfTwo;
        assert_eq!(layout.index_of(0), 0);
        assert_eq!(layout.index_of(1), 1);
        assert_eq!(layout.index_of(2), 2);
        assert_eq!(layout.index_of(3), 2);
        assert_eq!(layout.index_of(4), 3);
        assert_eq!(layout.index_of(1023), 10);
        assert_eq!(layout.index_of(1024), 11);
        assert_eq!(layout.index_of(u64::MAX), 64);

        for micros in [0, 1, 5, 999, 1 << 20, u64::MAX] {
            let index = layout.index_of(micros);
            assert!(micros <= layout.upper_bound(index));
            if index > 0 {
                assert!(micros > layout.upper_bound(index - 1));
            }
        }
    }

    #[test]
    fn linear_indices_and_overflow() {
        let layout = BucketLayout::Linear {
            width: ms(10),
            buckets: 5,
        };
        assert_eq!(layout.bucket_count(), 6);
        assert_eq!(layout.index_of(0), 0);
        assert_eq!(layout.index_of(9_999), 0);
        assert_eq!(layout.index_of(10_000), 1);
        assert_eq!(layout.index_of(49_999), 4);
        assert_eq!(layout.index_of(50_000), 5);
        assert_eq!(layout.index_of(u64::MAX), 5);
        assert_eq!(layout.upper_bound(0), 9_999);
        assert_eq!(layout.upper_bound(5), u64::MAX);
    }

    #[test]
    fn oversized_linear_layout_is_clamped() {
        let layout = BucketLayout::Linear {
            width: ms(1),
            buckets: usize::MAX,
        };
        assert_eq!(layout.bucket_count(), MAX_LINEAR_BUCKETS + 1);
        assert_eq!(layout.index_of(u64::MAX), MAX_LINEAR_BUCKETS);
        assert_eq!(layout.upper_bound(MAX_LINEAR_BUCKETS), u64::MAX);

        let mut h = LatencyHistogram::new(layout);
        h.record(Duration::from_secs(3_600));
        h.record(ms(2));
        assert_eq!(h.len(), 2);
        assert_eq!(h.counts()[MAX_LINEAR_BUCKETS], 1);
        assert_eq!(h.percentile(100.0), Duration::from_secs(3_600));
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let h = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        assert_eq!(h.percentile(50.0), Duration::ZERO);
        assert_eq!(h.mean(), Duration::ZERO);
        assert_eq!(h.min(), Duration::ZERO);
        assert_eq!(h.max(), Duration::ZERO);
    }

    #[test]
    fn single_value_is_exact() {
        let mut h = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        h.record(ms(37));
        for q in [0.0, 50.0, 99.9, 100.0] {
            assert_eq!(h.percentile(q), ms(37));
        }
    }

    #[test]
    fn linear_percentiles_within_one_bucket() {
        let mut h = LatencyHistogram::new(BucketLayout::Linear {
            width: ms(1),
            buckets: 1_000,
        });
        for v in 1..=100 {
            h.record(ms(v));
        }
        let p50 = h.percentile(50.0);
        assert!(p50 >= ms(50) && p50 < ms(51), "{p50:?}");
        let p99 = h.percentile(99.0);
        assert!(p99 >= ms(99) && p99 < ms(100), "{p99:?}");
        assert_eq!(h.percentile(100.0), ms(100));
        assert_eq!(h.mean(), Duration::from_micros(50_500));
    }

    #[test]
    fn power_of_two_error_is_bounded() {
        let mut h = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        for v in 1..=1_000 {
            h.record(Duration::from_micros(v * 100));
        }
        let p90 = h.percentile(90.0);
        let exact = Duration::from_micros(90_000);
        assert!(p90 >= exact && p90 < exact * 2, "{p90:?}");
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        let mut b = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        a.aggregate(&[ms(1), ms(2), ms(3)]);
        b.aggregate(&[ms(400), ms(500)]);
        a.merge(&b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.min(), ms(1));
        assert_eq!(a.max(), ms(500));
        assert_eq!(a.counts().iter().sum::<u64>(), 5);
    }

    #[test]
    fn merge_across_layouts_keeps_totals() {
        let mut linear = LatencyHistogram::new(BucketLayout::Linear {
            width: ms(5),
            buckets: 10,
        });
        let mut pow2 = LatencyHistogram::new(BucketLayout::PowerOfTwo);
        pow2.aggregate(&[ms(3), ms(12), ms(80)]);
        linear.merge(&pow2);
        assert_eq!(linear.len(), 3);
        assert_eq!(linear.counts().iter().sum::<u64>(), 3);
        assert_eq!(linear.max(), ms(80));
    }

    #[test]
    fn layout_from_yaml() {
        let layout: BucketLayout =
            serde_yaml::from_str("type: linear\nwidth_ms: 5\nbuckets: 200\n").unwrap();
        assert_eq!(
            layout,
            BucketLayout::Linear {
                width: ms(5),
                buckets: 200
            }
        );
        let layout: BucketLayout = serde_yaml::from_str("type: power_of_two\n").unwrap();
        assert_eq!(layout, BucketLayout::PowerOfTwo);
    }
}
