//! Per-metric ring buffer of bucketed sums.
//!
//! A [`Metric`] is a single named time series stored as a fixed-length ring
//! of `f32` accumulators, one per bucket of `bucket_width` seconds, plus a
//! lifetime total that is independent of retention.
//!
//! # Design
//!
//! - Bucket key: `floor(timestamp / bucket_width)`
//! - The head is the most recently written bucket. The ring covers bucket
//!   keys `[head_bucket_key - len + 1, head_bucket_key]`.
//! - Writes behind the head are added in place while still retained and
//!   dropped from the ring otherwise.
//! - Writes ahead of the head advance it one bucket at a time, zeroing each
//!   bucket it moves onto. Old data ages out by being overwritten.
//! - A write a full ring or more ahead resets the ring.
//!
//! None of the ring operations fail. Out-of-window timestamps contribute
//! zero to reads.
//!
//! # Thread Safety
//!
//! Each metric owns a reader-writer lock over its ring state. Reads of the
//! same metric proceed in parallel; a write is exclusive for that metric only.

use std::cmp::Ordering;

use parking_lot::RwLock;

use crate::config::StorageConfig;
use crate::pattern::split_name;
use crate::snapshot::MetricSnapshot;

/// Returns the bucket key of `timestamp`, flooring towards negative infinity.
#[inline]
pub fn bucket_key(timestamp: i64, bucket_width: i64) -> i64 {
    timestamp.div_euclid(bucket_width)
}

/// Returns the first bucket key whose start is at or after `timestamp`.
#[inline]
fn ceil_bucket_key(timestamp: i64, bucket_width: i64) -> i64 {
    let key = timestamp.div_euclid(bucket_width);
    if timestamp.rem_euclid(bucket_width) == 0 {
        key
    } else {
        key + 1
    }
}

/// A single named time series.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use almaz::config::StorageConfig;
/// use almaz::metric::Metric;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = StorageConfig::new(Duration::from_secs(10), Duration::from_secs(60))?;
/// let metric = Metric::new(&config, "stats.web1.requests", 1);
///
/// metric.store(2.0, 1);
/// metric.store(3.0, 9);
/// assert_eq!(metric.get_value_at(5), 5.0);
/// assert_eq!(metric.total(), 5.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Metric {
    name: String,
    segments: Vec<String>,
    bucket_width: i64,
    retention_buckets: usize,
    state: RwLock<RingState>,
}

/// Everything guarded by a metric's lock.
#[derive(Debug, Clone, PartialEq)]
struct RingState {
    ring: Vec<f32>,
    head_index: usize,
    head_bucket_key: i64,
    total: f64,
}

impl RingState {
    fn new(buckets: usize, head_bucket_key: i64) -> Self {
        Self {
            ring: vec![0.0; buckets.max(1)],
            head_index: 0,
            head_bucket_key,
            total: 0.0,
        }
    }

    #[allow(clippy::cast_possible_wrap)] // ring length is capped by MAX_RETENTION_BUCKETS
    fn len(&self) -> i64 {
        self.ring.len() as i64
    }

    fn oldest_key(&self) -> i64 {
        self.head_bucket_key.saturating_sub(self.len() - 1)
    }

    /// Maps a bucket key to its ring position, if the key is retained.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // 0 <= back < len
    fn index_of(&self, key: i64) -> Option<usize> {
        if key > self.head_bucket_key {
            return None;
        }
        let back = self.head_bucket_key.saturating_sub(key);
        if back >= self.len() {
            return None;
        }
        let n = self.ring.len();
        Some((self.head_index + n - back as usize) % n)
    }

    fn value_at_key(&self, key: i64) -> f32 {
        self.index_of(key).map_or(0.0, |i| self.ring[i])
    }

    fn store(&mut self, value: f32, key: i64) {
        self.total += f64::from(value);

        match key.cmp(&self.head_bucket_key) {
            Ordering::Less => {
                // Late arrival: silently dropped once aged out of the ring
                if let Some(i) = self.index_of(key) {
                    self.ring[i] += value;
                }
            }
            Ordering::Equal => {
                self.ring[self.head_index] += value;
            }
            Ordering::Greater => {
                let ahead = key.saturating_sub(self.head_bucket_key);
                if ahead >= self.len() {
                    self.ring.fill(0.0);
                    self.head_index = 0;
                } else {
                    let n = self.ring.len();
                    for _ in 0..ahead {
                        self.head_index = (self.head_index + 1) % n;
                        self.ring[self.head_index] = 0.0;
                    }
                }
                self.head_bucket_key = key;
                self.ring[self.head_index] += value;
            }
        }
    }

    /// Sums the retained buckets in the inclusive key range `[lo, hi]`.
    fn sum_keys(&self, lo: i64, hi: i64) -> f64 {
        let lo = lo.max(self.oldest_key());
        let hi = hi.min(self.head_bucket_key);
        (lo..=hi).map(|key| f64::from(self.value_at_key(key))).sum()
    }
}

impl Metric {
    /// Creates an empty metric whose head starts at the bucket of
    /// `starting_ts`, sized by `config`.
    pub fn new(config: &StorageConfig, name: &str, starting_ts: i64) -> Self {
        let bucket_width = config.bucket_width_secs().max(1);
        let state = RingState::new(config.retention_buckets(), bucket_key(starting_ts, bucket_width));
        Self {
            name: name.to_string(),
            segments: split_name(name),
            bucket_width,
            retention_buckets: state.ring.len(),
            state: RwLock::new(state),
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the cached dot-separated name segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the bucket width in seconds.
    pub fn bucket_width_secs(&self) -> i64 {
        self.bucket_width
    }

    /// Returns the number of buckets in the ring.
    pub fn retention_buckets(&self) -> usize {
        self.retention_buckets
    }

    /// Returns the bucket key of the most recently written bucket.
    pub fn head_bucket_key(&self) -> i64 {
        self.state.read().head_bucket_key
    }

    /// Returns the bucket key of `timestamp` for this metric's width.
    pub fn bucket_key(&self, timestamp: i64) -> i64 {
        bucket_key(timestamp, self.bucket_width)
    }

    /// Adds `value` at `timestamp` and returns the new lifetime total.
    ///
    /// The lifetime total is always incremented, even when the write is too
    /// old to land in the ring.
    pub fn store(&self, value: f32, timestamp: i64) -> f64 {
        let key = self.bucket_key(timestamp);
        let mut state = self.state.write();
        state.store(value, key);
        state.total
    }

    /// Overwrites the lifetime total.
    pub fn set_total(&self, total: f64) {
        self.state.write().total = total;
    }

    /// Returns the lifetime total.
    pub fn total(&self) -> f64 {
        self.state.read().total
    }

    /// Returns the accumulated value of the bucket containing `timestamp`,
    /// or 0 if that bucket is outside the retained window.
    pub fn get_value_at(&self, timestamp: i64) -> f64 {
        let key = self.bucket_key(timestamp);
        f64::from(self.state.read().value_at_key(key))
    }

    /// Sums every retained bucket whose key lies in
    /// `[bucket_key(ts1), bucket_key(ts2)]`. Both bounds are inclusive.
    pub fn get_sum_between(&self, ts1: i64, ts2: i64) -> f64 {
        let lo = self.bucket_key(ts1);
        let hi = self.bucket_key(ts2);
        self.state.read().sum_keys(lo, hi)
    }

    /// Sums the buckets covering `[now - seconds, now]`.
    pub fn get_sum_for_last_n_seconds(&self, seconds: i64, now: i64) -> f64 {
        self.get_sum_between(now.saturating_sub(seconds), now)
    }

    /// Computes one trailing-window sum per period, all ending at `now`.
    ///
    /// The window for period `p` starts at the first bucket boundary at or
    /// after `now - p`. All windows share one forward sweep over the buckets
    /// from the earliest start up to the bucket of `now`.
    ///
    /// With `interpolate`, each window also receives the bucket straddling
    /// its start, weighted by `1 - f` where `f` is the fractional position of
    /// `now` inside its own bucket. When `now` sits exactly on a boundary the
    /// weight is 1.
    #[allow(clippy::cast_precision_loss)] // offsets are smaller than the bucket width
    pub fn get_sums_per_period_until_now(
        &self,
        periods: &[i64],
        now: i64,
        interpolate: bool,
    ) -> Vec<f64> {
        let mut sums = vec![0.0; periods.len()];
        if periods.is_empty() {
            return sums;
        }

        let width = self.bucket_width;
        let starts: Vec<i64> = periods
            .iter()
            .map(|&p| ceil_bucket_key(now.saturating_sub(p), width))
            .collect();
        let first = starts.iter().copied().min().unwrap_or(i64::MAX);

        let state = self.state.read();
        let lo = first.max(state.oldest_key());
        let hi = bucket_key(now, width).min(state.head_bucket_key);

        for key in lo..=hi {
            let value = f64::from(state.value_at_key(key));
            if value == 0.0 {
                continue;
            }
            for (sum, &start) in sums.iter_mut().zip(&starts) {
                if start <= key {
                    *sum += value;
                }
            }
        }

        if interpolate {
            let offset = now.rem_euclid(width) as f64 / width as f64;
            let weight = 1.0 - offset;
            for (sum, &start) in sums.iter_mut().zip(&starts) {
                *sum += f64::from(state.value_at_key(start - 1)) * weight;
            }
        }

        sums
    }

    /// Returns true if the whole ring lies before the window ending at `now`,
    /// i.e. nothing has been written for at least one full retention span.
    pub fn is_stale(&self, now: i64) -> bool {
        let state = self.state.read();
        state.head_bucket_key.saturating_add(state.len()) <= self.bucket_key(now)
    }

    /// Captures the metric's full state for persistence.
    pub fn snapshot(&self) -> MetricSnapshot {
        let state = self.state.read();
        MetricSnapshot {
            name: self.name.clone(),
            bucket_width_secs: self.bucket_width,
            retention_buckets: self.retention_buckets,
            ring: state.ring.clone(),
            head_index: state.head_index,
            head_bucket_key: state.head_bucket_key,
            total: state.total,
        }
    }

    /// Rebuilds a metric from a validated snapshot record, recomputing the
    /// cached name segments.
    pub fn from_snapshot(snapshot: MetricSnapshot) -> Self {
        let MetricSnapshot {
            name,
            bucket_width_secs,
            retention_buckets: _,
            ring,
            head_index,
            head_bucket_key,
            total,
        } = snapshot;

        Self {
            segments: split_name(&name),
            name,
            bucket_width: bucket_width_secs,
            retention_buckets: ring.len(),
            state: RwLock::new(RingState {
                ring,
                head_index,
                head_bucket_key,
                total,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// 10 second buckets, 6 buckets of retention, head at ts=1.
    fn create_test_metric() -> Metric {
        let config = StorageConfig::new(Duration::from_secs(10), Duration::from_secs(60)).unwrap();
        Metric::new(&config, "test.metric", 1)
    }

    fn ring(metric: &Metric) -> Vec<f32> {
        metric.state.read().ring.clone()
    }

    fn head_index(metric: &Metric) -> usize {
        metric.state.read().head_index
    }

    /// Writes at ts=1,12,38,55 then 64,88: buckets 0,1,3,5 then 6 and 8.
    #[allow(clippy::cast_precision_loss)]
    fn create_wrapped_metric() -> Metric {
        let metric = create_test_metric();
        for ts in [1, 12, 38, 55, 64, 88] {
            metric.store(ts as f32, ts);
        }
        metric
    }

    #[test]
    fn test_bucket_keys() {
        assert_eq!(bucket_key(0, 10), 0);
        assert_eq!(bucket_key(9, 10), 0);
        assert_eq!(bucket_key(10, 10), 1);
        assert_eq!(bucket_key(-1, 10), -1);
        assert_eq!(ceil_bucket_key(10, 10), 1);
        assert_eq!(ceil_bucket_key(11, 10), 2);
        assert_eq!(ceil_bucket_key(-6, 10), 0);
        assert_eq!(ceil_bucket_key(-10, 10), -1);
    }

    #[test]
    fn test_addition() {
        let metric = create_test_metric();
        metric.store(2.0, 1); // bucket 0
        metric.store(2.0, 1); // bucket 0
        metric.store(1.0, 4); // bucket 0
        metric.store(1.0, 9); // bucket 0
        metric.store(1.0, 11); // bucket 1
        metric.store(88.0, 24); // bucket 2
        metric.store(11.0, 28); // bucket 2

        let buckets = ring(&metric);
        assert_eq!(buckets[0], 6.0);
        assert_eq!(buckets[1], 1.0);
        assert_eq!(buckets[2], 99.0);
        assert_eq!(metric.total(), 106.0);
    }

    #[test]
    fn test_store_returns_running_total() {
        let metric = create_test_metric();
        assert_eq!(metric.store(3.0, 1), 3.0);
        assert_eq!(metric.store(4.0, 15), 7.0);
        assert_eq!(metric.store(-2.0, 15), 5.0);
    }

    #[test]
    fn test_circularity() {
        let metric = create_test_metric();
        metric.store(1.0, 1); // bucket 0
        metric.store(12.0, 12); // bucket 1
        metric.store(38.0, 38); // bucket 3
        metric.store(55.0, 55); // bucket 5

        assert_eq!(ring(&metric), vec![1.0, 12.0, 0.0, 38.0, 0.0, 55.0]);
        assert_eq!(head_index(&metric), 5);

        metric.store(64.0, 64); // bucket 6 -> slot 0
        metric.store(88.0, 88); // bucket 8 -> slot 2

        assert_eq!(ring(&metric), vec![64.0, 0.0, 88.0, 38.0, 0.0, 55.0]);
        assert_eq!(head_index(&metric), 2);
        assert_eq!(metric.head_bucket_key(), 8);
    }

    #[test]
    fn test_get_value_at() {
        let metric = create_wrapped_metric();

        assert_eq!(metric.get_value_at(1), 0.0); // aged out
        assert_eq!(metric.get_value_at(14), 0.0); // aged out
        assert_eq!(metric.get_value_at(29), 0.0); // aged out
        assert_eq!(metric.get_value_at(32), 38.0);
        assert_eq!(metric.get_value_at(46), 0.0);
        assert_eq!(metric.get_value_at(55), 55.0);
        assert_eq!(metric.get_value_at(60), 64.0);
        assert_eq!(metric.get_value_at(73), 0.0);
        assert_eq!(metric.get_value_at(81), 88.0);
        assert_eq!(metric.get_value_at(96), 0.0); // ahead of head
        assert_eq!(metric.get_value_at(105), 0.0);
    }

    #[test]
    fn test_get_sum_between_is_inclusive() {
        let metric = create_wrapped_metric();

        assert_eq!(metric.get_sum_between(1, 19), 0.0);
        assert_eq!(metric.get_sum_between(1, 29), 0.0);
        assert_eq!(metric.get_sum_between(1, 35), 38.0); // upper bucket included
        assert_eq!(metric.get_sum_between(1, 59), 38.0 + 55.0);
        assert_eq!(metric.get_sum_between(1, 64), 38.0 + 55.0 + 64.0);
        assert_eq!(metric.get_sum_between(41, 69), 55.0 + 64.0);
        assert_eq!(metric.get_sum_between(41, 77), 55.0 + 64.0);
        assert_eq!(metric.get_sum_between(41, 83), 55.0 + 64.0 + 88.0);
        assert_eq!(metric.get_sum_between(41, 183), 55.0 + 64.0 + 88.0);
        assert_eq!(metric.get_sum_between(0, 183), 38.0 + 55.0 + 64.0 + 88.0);
        assert_eq!(metric.get_sum_between(92, 183), 0.0);
        assert_eq!(metric.get_sum_between(70, 50), 0.0); // reversed range
    }

    #[test]
    fn test_get_sum_for_last_n_seconds() {
        let metric = create_wrapped_metric();

        assert_eq!(metric.get_sum_for_last_n_seconds(5, 100), 0.0);
        assert_eq!(metric.get_sum_for_last_n_seconds(20, 100), 88.0);
    }

    #[test]
    fn test_late_arrival_is_added() {
        let metric = create_test_metric();
        metric.store(10.0, 12); // bucket 1
        metric.store(20.0, 55); // bucket 5

        metric.store(5.0, 15); // late, still retained
        assert_eq!(metric.get_value_at(12), 15.0);
        assert_eq!(metric.head_bucket_key(), 5);
        assert_eq!(metric.total(), 35.0);
    }

    #[test]
    fn test_late_arrival_wraps_past_index_zero() {
        let metric = create_test_metric();
        metric.store(1.0, 1); // bucket 0
        metric.store(55.0, 55); // bucket 5
        metric.store(88.0, 88); // bucket 8 -> slot 2
        assert_eq!(head_index(&metric), 2);

        // Bucket 5 is three behind the head and lives in slot 5
        metric.store(4.0, 51);
        assert_eq!(ring(&metric), vec![0.0, 0.0, 88.0, 0.0, 0.0, 59.0]);
        assert_eq!(metric.get_value_at(55), 59.0);
        assert_eq!(head_index(&metric), 2);
        assert_eq!(metric.head_bucket_key(), 8);
        assert_eq!(metric.total(), 148.0);
    }

    #[test]
    fn test_retention_buckets_fixed_at_creation() {
        let metric = create_wrapped_metric();
        assert_eq!(metric.retention_buckets(), 6);
        metric.store(1.0, 10_000); // far-future reset keeps the shape
        assert_eq!(metric.retention_buckets(), 6);
        assert_eq!(Metric::from_snapshot(metric.snapshot()).retention_buckets(), 6);
    }

    #[test]
    fn test_aged_out_write_counts_toward_total_only() {
        let metric = create_wrapped_metric(); // head bucket 8, oldest retained 3
        let before = ring(&metric);

        let total = metric.store(7.0, 21); // bucket 2, aged out
        assert_eq!(ring(&metric), before);
        assert_eq!(total, 1.0 + 12.0 + 38.0 + 55.0 + 64.0 + 88.0 + 7.0);
    }

    #[test]
    fn test_future_jump_resets_ring() {
        let metric = create_test_metric();
        metric.store(1.0, 1);
        metric.store(2.0, 25);
        metric.store(3.0, 55);

        metric.store(9.0, 500); // bucket 50, far beyond the ring
        assert_eq!(ring(&metric), vec![9.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(head_index(&metric), 0);
        assert_eq!(metric.head_bucket_key(), 50);
        assert_eq!(metric.get_value_at(55), 0.0);
        assert_eq!(metric.total(), 15.0);
    }

    #[test]
    fn test_jump_of_exactly_one_ring_resets() {
        let metric = create_test_metric();
        metric.store(1.0, 1); // bucket 0
        metric.store(4.0, 35); // bucket 3, head index 3

        metric.store(2.0, 95); // bucket 9: 6 ahead of head
        assert_eq!(ring(&metric), vec![2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(head_index(&metric), 0);
    }

    #[test]
    fn test_advance_zeroes_passed_buckets() {
        let metric = create_test_metric();
        for ts in [1, 11, 21, 31, 41, 51] {
            metric.store(1.0, ts);
        }
        assert_eq!(ring(&metric), vec![1.0; 6]);

        metric.store(5.0, 85); // bucket 8: slots for buckets 6 and 7 zeroed
        assert_eq!(ring(&metric), vec![0.0, 0.0, 5.0, 1.0, 1.0, 1.0]);
        assert_eq!(metric.get_sum_between(0, 100), 8.0);
    }

    #[test]
    fn test_negative_value_cancels() {
        let metric = create_test_metric();
        metric.store(10.0, 42);
        metric.store(-4.0, 42);
        assert_eq!(metric.get_value_at(42), 6.0);
        assert_eq!(metric.total(), 6.0);
    }

    #[test]
    fn test_set_total() {
        let metric = create_test_metric();
        metric.store(3.0, 1);
        metric.set_total(1000.0);
        assert_eq!(metric.total(), 1000.0);
        assert_eq!(metric.store(1.0, 2), 1001.0);
        // Ring is untouched by the override
        assert_eq!(metric.get_value_at(2), 4.0);
    }

    #[test]
    fn test_period_sums() {
        let metric = create_wrapped_metric();
        let periods = [10, 20, 30, 40, 60, 100];

        let sums = metric.get_sums_per_period_until_now(&periods, 94, false);
        assert_eq!(sums.len(), 6);
        assert_eq!(sums[0], 0.0); // 90..94
        assert_eq!(sums[1], 88.0); // 80..94
        assert_eq!(sums[2], 88.0); // 70..94
        assert_eq!(sums[3], 64.0 + 88.0); // 60..94
        assert_eq!(sums[4], 55.0 + 64.0 + 88.0); // 40..94
        // -10..94, but only buckets 3..8 are retained
        assert_eq!(sums[5], 38.0 + 55.0 + 64.0 + 88.0);

        let sums = metric.get_sums_per_period_until_now(&periods, 174, false);
        assert_eq!(sums, vec![0.0, 0.0, 0.0, 0.0, 0.0, 88.0]);

        // Entirely before the retained window
        let sums = metric.get_sums_per_period_until_now(&[10, 20], 22, false);
        assert_eq!(sums, vec![0.0, 0.0]);
    }

    #[test]
    fn test_period_sums_match_individual_ranges() {
        let metric = create_wrapped_metric();
        let now = 94;
        let periods = [15, 35, 45];
        let sums = metric.get_sums_per_period_until_now(&periods, now, false);

        for (sum, &p) in sums.iter().zip(&periods) {
            let start = ceil_bucket_key(now - p, 10) * 10;
            assert_eq!(*sum, metric.get_sum_between(start, now), "period {p}");
        }
    }

    #[test]
    fn test_period_sums_with_no_periods() {
        let metric = create_wrapped_metric();
        assert!(metric.get_sums_per_period_until_now(&[], 94, true).is_empty());
    }

    #[test]
    fn test_period_sums_interpolated() {
        let metric = create_wrapped_metric();

        // now=94 is 0.4 into its bucket, so straddling buckets weigh 0.6
        let sums = metric.get_sums_per_period_until_now(&[20, 40, 60], 94, true);
        assert!((sums[0] - 88.0).abs() < 1e-9); // straddles bucket 7, empty
        assert!((sums[1] - (64.0 + 88.0 + 55.0 * 0.6)).abs() < 1e-9);
        assert!((sums[2] - (55.0 + 64.0 + 88.0 + 38.0 * 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_on_bucket_boundary_uses_full_weight() {
        let metric = create_wrapped_metric();

        // now=90 sits on a boundary: window 70..90 straddles bucket 6 at weight 1
        let plain = metric.get_sums_per_period_until_now(&[20], 90, false);
        let smooth = metric.get_sums_per_period_until_now(&[20], 90, true);
        assert_eq!(plain[0], 88.0);
        assert!((smooth[0] - (88.0 + 64.0)).abs() < 1e-9);
    }

    #[test]
    fn test_is_stale() {
        let metric = create_test_metric();
        metric.store(1.0, 55); // head bucket 5, ring covers 0..5

        assert!(!metric.is_stale(55));
        assert!(!metric.is_stale(109)); // bucket 10 still covers head 5
        assert!(metric.is_stale(110)); // bucket 11: ring covers 6..11
    }

    #[test]
    fn test_segments_cached() {
        let metric = create_test_metric();
        assert_eq!(metric.segments(), &["test".to_string(), "metric".to_string()]);
        assert_eq!(metric.name(), "test.metric");
        assert_eq!(metric.retention_buckets(), 6);
        assert_eq!(metric.bucket_width_secs(), 10);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let metric = create_wrapped_metric();
        metric.set_total(123.5);

        let restored = Metric::from_snapshot(metric.snapshot());
        assert_eq!(restored.snapshot(), metric.snapshot());
        assert_eq!(restored.segments(), metric.segments());
        assert_eq!(restored.get_value_at(81), 88.0);
    }
}
