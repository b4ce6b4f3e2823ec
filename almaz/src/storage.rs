//! Metric index for almaz.
//!
//! [`Storage`] maps metric names to [`Metric`] rings. Metrics are created
//! lazily on their first write, sized by the [`StorageConfig`] in effect at
//! that moment.
//!
//! # Overview
//!
//! - [`Storage::store_metric`] - create-or-write, returns the lifetime total
//! - [`Storage::store_existing`] - write without structural mutation
//! - [`Storage::sum_by_period_grouping_query`] - wildcard grouped period sums
//! - [`Storage::prune_stale`] - drop metrics with no writes for a full ring
//! - [`Storage::save_snapshot`] / [`Storage::load_snapshot`] - persistence
//!
//! # Thread Safety
//!
//! Writes to existing metrics only need `&self`, since every metric guards
//! its own ring. Creating, removing, pruning, and loading need `&mut self`;
//! callers provide the structural lock (see
//! [`Coordinator`](crate::coordinator::Coordinator)).

use std::collections::HashMap;
use std::path::Path;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::metric::Metric;
use crate::pattern::MetricPattern;
use crate::snapshot::{self, StorageSnapshot};

/// Index of all metrics.
///
/// # Example
///
/// ```rust
/// use almaz::config::StorageConfig;
/// use almaz::storage::Storage;
///
/// let mut storage = Storage::new(StorageConfig::default());
/// storage.store_metric("stats.web1.requests", 3.0, 1_700_000_000);
/// storage.store_metric("stats.web2.requests", 4.0, 1_700_000_000);
///
/// let rows = storage.sum_by_period_grouping_query(&["stats.*.requests"], &[3600], 1_700_000_010, false);
/// assert_eq!(rows, vec![vec![7.0]]);
/// ```
#[derive(Debug, Default)]
pub struct Storage {
    /// Configuration applied to newly created metrics.
    config: StorageConfig,
    /// Map from metric name to its ring.
    metrics: HashMap<String, Metric>,
}

impl Storage {
    /// Creates an empty index.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            metrics: HashMap::new(),
        }
    }

    /// Returns the configuration used for newly created metrics.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Replaces the configuration for metrics created from now on.
    ///
    /// Existing metrics keep their bucket width and ring length.
    pub fn set_config(&mut self, config: StorageConfig) {
        self.config = config;
    }

    /// Stores a value, creating the metric on first occurrence.
    ///
    /// Returns the metric's updated lifetime total.
    pub fn store_metric(&mut self, name: &str, value: f32, timestamp: i64) -> f64 {
        if let Some(metric) = self.metrics.get(name) {
            return metric.store(value, timestamp);
        }

        tracing::trace!(metric = name, "creating metric");
        let metric = Metric::new(&self.config, name, timestamp);
        let total = metric.store(value, timestamp);
        self.metrics.insert(name.to_string(), metric);
        total
    }

    /// Stores a value into an existing metric.
    ///
    /// Returns `None` without side effects if the metric does not exist yet.
    pub fn store_existing(&self, name: &str, value: f32, timestamp: i64) -> Option<f64> {
        self.metrics
            .get(name)
            .map(|metric| metric.store(value, timestamp))
    }

    /// Overwrites a metric's lifetime total. Unknown metrics are ignored.
    pub fn set_total(&self, name: &str, total: f64) {
        if let Some(metric) = self.metrics.get(name) {
            metric.set_total(total);
        }
    }

    /// Removes a metric. Returns `true` if it existed.
    pub fn remove_metric(&mut self, name: &str) -> bool {
        self.metrics.remove(name).is_some()
    }

    /// Returns the metric with the given name.
    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    /// Checks whether a metric exists.
    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    /// Returns the number of metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns the number of metrics, as reported by audits.
    pub fn metric_count(&self) -> usize {
        self.len()
    }

    /// Returns true if no metric exists.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Returns all metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Computes trailing-window sums for every metric, sorted by name.
    pub fn sums_per_period(
        &self,
        periods: &[i64],
        now: i64,
        interpolate: bool,
    ) -> Vec<(String, Vec<f64>)> {
        let mut rows: Vec<(String, Vec<f64>)> = self
            .metrics
            .iter()
            .map(|(name, metric)| {
                (
                    name.clone(),
                    metric.get_sums_per_period_until_now(periods, now, interpolate),
                )
            })
            .collect();
        rows.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Sums trailing windows of all metrics into one row per pattern.
    ///
    /// Each metric contributes to the first pattern, in the given order,
    /// that matches its name segments, and to no other. Patterns that match
    /// nothing yield all-zero rows.
    pub fn sum_by_period_grouping_query<S: AsRef<str>>(
        &self,
        patterns: &[S],
        periods: &[i64],
        now: i64,
        interpolate: bool,
    ) -> Vec<Vec<f64>> {
        let patterns: Vec<MetricPattern> = patterns
            .iter()
            .map(|p| MetricPattern::parse(p.as_ref()))
            .collect();
        let mut rows = vec![vec![0.0; periods.len()]; patterns.len()];

        for metric in self.metrics.values() {
            let Some(group) = patterns.iter().position(|p| p.matches(metric.segments())) else {
                continue;
            };
            let sums = metric.get_sums_per_period_until_now(periods, now, interpolate);
            for (acc, sum) in rows[group].iter_mut().zip(sums) {
                *acc += sum;
            }
        }

        rows
    }

    /// Removes every metric that has received no write for at least its
    /// full retention window as of `now`. Returns the removed names.
    pub fn prune_stale(&mut self, now: i64) -> Vec<String> {
        let stale: Vec<String> = self
            .metrics
            .iter()
            .filter(|(_, metric)| metric.is_stale(now))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            self.metrics.remove(name);
        }

        if !stale.is_empty() {
            tracing::debug!(pruned = stale.len(), remaining = self.metrics.len(), "pruned stale metrics");
        }
        stale
    }

    /// Captures every metric for persistence, sorted by name.
    pub fn to_snapshot(&self) -> StorageSnapshot {
        let mut metrics: Vec<_> = self.metrics.values().map(Metric::snapshot).collect();
        metrics.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        StorageSnapshot { metrics }
    }

    /// Replaces the whole index with the contents of `snapshot`.
    ///
    /// Name segments are recomputed from the restored names. The storage
    /// configuration is left as is.
    pub fn replace_with_snapshot(&mut self, snapshot: StorageSnapshot) {
        self.metrics = snapshot
            .metrics
            .into_iter()
            .map(|m| (m.name.clone(), Metric::from_snapshot(m)))
            .collect();
    }

    /// Saves the whole index to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`](crate::error::SnapshotError) if the
    /// snapshot cannot be written. The existing file at `path` is untouched.
    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        snapshot::write_atomic(&self.to_snapshot(), path)?;
        tracing::info!(path = %path.display(), metrics = self.metrics.len(), "saved snapshot");
        Ok(())
    }

    /// Loads the index from `path`, replacing the current one on success.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`](crate::error::SnapshotError) if the file is
    /// missing, unreadable, or corrupt. The in-memory index is untouched.
    pub fn load_snapshot<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = snapshot::read(path)?;
        self.install_snapshot(snapshot, path);
        Ok(())
    }

    /// Replaces the index with an already decoded snapshot read from `path`
    /// and logs the load.
    pub(crate) fn install_snapshot(&mut self, snapshot: StorageSnapshot, path: &Path) {
        self.replace_with_snapshot(snapshot);
        tracing::info!(path = %path.display(), metrics = self.metrics.len(), "loaded snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> StorageConfig {
        StorageConfig::new(Duration::from_secs(10), Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_store_creates_metric() {
        let mut storage = Storage::new(test_config());
        assert!(storage.is_empty());

        assert_eq!(storage.store_metric("a.b", 2.0, 5), 2.0);
        assert_eq!(storage.store_metric("a.b", 3.0, 7), 5.0);

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.metric_count(), 1);
        assert!(storage.contains("a.b"));
        assert_eq!(storage.get("a.b").unwrap().get_value_at(5), 5.0);
    }

    #[test]
    fn test_store_existing() {
        let mut storage = Storage::new(test_config());
        assert_eq!(storage.store_existing("x", 1.0, 5), None);
        assert!(storage.is_empty());

        storage.store_metric("x", 1.0, 5);
        assert_eq!(storage.store_existing("x", 1.0, 5), Some(2.0));
    }

    #[test]
    fn test_set_total() {
        let mut storage = Storage::new(test_config());

        // Unknown metric: ignored, nothing created
        storage.set_total("missing", 10.0);
        assert!(!storage.contains("missing"));

        storage.store_metric("known", 1.0, 5);
        storage.set_total("known", 500.0);
        assert_eq!(storage.get("known").unwrap().total(), 500.0);
        assert_eq!(storage.store_metric("known", 1.0, 5), 501.0);
    }

    #[test]
    fn test_remove_metric() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("a.b", 1.0, 5);

        assert!(storage.remove_metric("a.b"));
        assert!(!storage.remove_metric("a.b"));
        assert!(storage.is_empty());

        // Removed metrics no longer take part in grouping
        let rows = storage.sum_by_period_grouping_query(&["a.*"], &[60], 5, false);
        assert_eq!(rows, vec![vec![0.0]]);
    }

    #[test]
    fn test_config_is_not_retroactive() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("old", 1.0, 5);

        storage.set_config(StorageConfig::new(Duration::from_secs(60), Duration::from_secs(3600)).unwrap());
        storage.store_metric("new", 1.0, 5);

        let old = storage.get("old").unwrap();
        assert_eq!(old.bucket_width_secs(), 10);
        assert_eq!(old.retention_buckets(), 6);

        let new = storage.get("new").unwrap();
        assert_eq!(new.bucket_width_secs(), 60);
        assert_eq!(new.retention_buckets(), 60);
    }

    #[test]
    fn test_grouping_first_match_wins() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("stats.web1.requests", 1.0, 5);
        storage.store_metric("stats.web2.requests", 2.0, 5);
        storage.store_metric("stats.web1.errors", 4.0, 5);

        let rows = storage.sum_by_period_grouping_query(
            &["stats.web1.*", "stats.*.requests", "stats.*.*"],
            &[60],
            5,
            false,
        );

        // web1.requests matches all three patterns but only counts once
        assert_eq!(rows[0], vec![1.0 + 4.0]);
        assert_eq!(rows[1], vec![2.0]);
        assert_eq!(rows[2], vec![0.0]);
    }

    #[test]
    fn test_grouping_unmatched_and_empty() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("a.b", 1.0, 5);

        let rows = storage.sum_by_period_grouping_query(&["x.*", "a"], &[10, 60], 5, false);
        assert_eq!(rows, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);

        let rows = storage.sum_by_period_grouping_query::<&str>(&[], &[10], 5, false);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_grouping_multiple_periods() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("hits.a", 1.0, 5); // bucket 0
        storage.store_metric("hits.a", 2.0, 25); // bucket 2
        storage.store_metric("hits.b", 4.0, 25); // bucket 2

        // 10s window starts at bucket 2, 30s window reaches back to bucket 0
        let rows = storage.sum_by_period_grouping_query(&["hits.*"], &[10, 30], 29, false);
        assert_eq!(rows, vec![vec![6.0, 7.0]]);
    }

    #[test]
    fn test_sums_per_period_sorted() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("b", 2.0, 5);
        storage.store_metric("a", 1.0, 5);

        let rows = storage.sums_per_period(&[60], 5, false);
        assert_eq!(rows, vec![
            ("a".to_string(), vec![1.0]),
            ("b".to_string(), vec![2.0]),
        ]);
        assert_eq!(storage.metric_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_prune_stale() {
        let mut storage = Storage::new(test_config());
        storage.store_metric("old", 1.0, 5); // bucket 0
        storage.store_metric("fresh", 1.0, 55); // bucket 5

        // At bucket 6 the ring of "old" covers 1..6 and no longer reaches bucket 0
        let mut pruned = storage.prune_stale(65);
        pruned.sort();
        assert_eq!(pruned, vec!["old"]);
        assert!(storage.contains("fresh"));

        assert!(storage.prune_stale(65).is_empty());
        assert_eq!(storage.prune_stale(115), vec!["fresh"]);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("almaz.dat");

        let mut storage = Storage::new(test_config());
        storage.store_metric("stats.a.hits", 1.0, 5);
        storage.store_metric("stats.b.hits", 2.0, 38);
        storage.set_total("stats.b.hits", 99.0);
        storage.save_snapshot(&path).unwrap();

        let mut restored = Storage::new(StorageConfig::default());
        restored.load_snapshot(&path).unwrap();

        assert_eq!(restored.to_snapshot(), storage.to_snapshot());
        assert_eq!(
            restored.sum_by_period_grouping_query(&["stats.*.hits"], &[60], 40, false),
            storage.sum_by_period_grouping_query(&["stats.*.hits"], &[60], 40, false),
        );
        // Loading keeps the receiving index's configuration
        assert_eq!(restored.config(), &StorageConfig::default());
    }

    #[test]
    fn test_load_replaces_instead_of_merging() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("almaz.dat");

        let mut saved = Storage::new(test_config());
        saved.store_metric("saved", 1.0, 5);
        saved.save_snapshot(&path).unwrap();

        let mut storage = Storage::new(test_config());
        storage.store_metric("in.memory", 1.0, 5);
        storage.load_snapshot(&path).unwrap();

        assert_eq!(storage.metric_names(), vec!["saved"]);
    }

    #[test]
    fn test_failed_load_keeps_index() {
        let temp_dir = tempdir().unwrap();

        let mut storage = Storage::new(test_config());
        storage.store_metric("kept", 1.0, 5);

        assert!(storage.load_snapshot(temp_dir.path().join("missing.dat")).is_err());
        assert_eq!(storage.metric_names(), vec!["kept"]);
    }
}
