//! Coordinator tying the metric index to concurrent ingest and query paths.
//!
//! The [`Coordinator`] owns the structural lock around the [`Storage`]
//! index. Each metric additionally guards its own ring, giving two lock
//! tiers:
//!
//! - Writes to existing metrics and read-only queries take the structural
//!   lock as readers, so many of them run in parallel.
//! - Metric creation, removal, pruning, configuration changes, and snapshot
//!   save/load take the structural lock as the writer.
//!
//! The structural lock is always acquired before any metric lock.
//!
//! # Example Usage
//!
//! ```rust
//! use almaz::config::StorageConfig;
//! use almaz::coordinator::{Coordinator, Observation};
//!
//! let coordinator = Coordinator::new(StorageConfig::default());
//!
//! if let Some(obs) = Observation::parse_line("stats.web1.requests 3 1700000000") {
//!     coordinator.store(&obs.name, obs.value, obs.timestamp);
//! }
//!
//! let rows = coordinator.group_query(&["stats.*.requests"], &[60, 3600], 1_700_000_030, true);
//! assert_eq!(rows[0][1], 3.0);
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::storage::Storage;

/// Receives every accepted write.
///
/// Implementations fan updates out to external subscribers. Delivery
/// problems are theirs to handle; the coordinator ignores them.
pub trait UpdateListener: Send + Sync {
    /// Called after `value` was stored into `name`, with the metric's new
    /// lifetime total.
    fn on_update(&self, name: &str, value: f32, total: f64);
}

/// A single `(name, value, timestamp)` sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Dot-segmented metric name.
    pub name: String,
    /// Sample value.
    pub value: f32,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl Observation {
    /// Creates an observation.
    pub fn new(name: impl Into<String>, value: f32, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }

    /// Parses a Carbon plaintext line: `<name> <value> <timestamp>`.
    ///
    /// Fields are separated by single spaces. Returns `None` for lines with
    /// the wrong field count or an unparsable value or timestamp.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use almaz::coordinator::Observation;
    ///
    /// let obs = Observation::parse_line("stats.hits 1.5 1700000000").unwrap();
    /// assert_eq!(obs.name, "stats.hits");
    /// assert_eq!(obs.value, 1.5);
    /// assert_eq!(obs.timestamp, 1_700_000_000);
    ///
    /// assert!(Observation::parse_line("stats.hits 1.5").is_none());
    /// assert!(Observation::parse_line("stats.hits abc 1700000000").is_none());
    /// ```
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).split(' ');
        let (Some(name), Some(value), Some(timestamp), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };

        let value = value.parse::<f32>().ok()?;
        let timestamp = timestamp.parse::<i64>().ok()?;
        Some(Self::new(name, value, timestamp))
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.value, self.timestamp)
    }
}

/// Owner of the metric index and its structural lock.
pub struct Coordinator {
    storage: RwLock<Storage>,
    listeners: Vec<Arc<dyn UpdateListener>>,
}

impl Coordinator {
    /// Creates a coordinator over an empty index.
    pub fn new(config: StorageConfig) -> Self {
        Self::from_storage(Storage::new(config))
    }

    /// Creates a coordinator over an existing index.
    pub fn from_storage(storage: Storage) -> Self {
        Self {
            storage: RwLock::new(storage),
            listeners: Vec::new(),
        }
    }

    /// Registers a listener notified after every accepted write.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn UpdateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Stores a value and returns the metric's new lifetime total.
    ///
    /// Existing metrics are written under the structural read lock. The
    /// write lock is taken only when the metric has to be created.
    pub fn store(&self, name: &str, value: f32, timestamp: i64) -> f64 {
        let existing = self.storage.read().store_existing(name, value, timestamp);
        let total = match existing {
            Some(total) => total,
            // store_metric re-checks: another writer may have created it meanwhile
            None => self.storage.write().store_metric(name, value, timestamp),
        };

        for listener in &self.listeners {
            listener.on_update(name, value, total);
        }
        total
    }

    /// Stores a batch of observations in order.
    pub fn store_batch(&self, observations: &[Observation]) {
        for obs in observations {
            self.store(&obs.name, obs.value, obs.timestamp);
        }
    }

    /// Overwrites a metric's lifetime total. Unknown metrics are ignored.
    pub fn set_total(&self, name: &str, total: f64) {
        self.storage.read().set_total(name, total);
    }

    /// Removes a metric. Returns `true` if it existed.
    pub fn remove_metric(&self, name: &str) -> bool {
        self.storage.write().remove_metric(name)
    }

    /// Returns the number of metrics.
    pub fn metric_count(&self) -> usize {
        self.storage.read().len()
    }

    /// Returns the lifetime total of a metric, if it exists.
    pub fn total(&self, name: &str) -> Option<f64> {
        self.storage.read().get(name).map(|m| m.total())
    }

    /// Returns the configuration applied to newly created metrics.
    pub fn config(&self) -> StorageConfig {
        *self.storage.read().config()
    }

    /// Changes the configuration for metrics created from now on.
    pub fn set_config(&self, config: StorageConfig) {
        self.storage.write().set_config(config);
    }

    /// Computes trailing-window sums for every metric, sorted by name.
    pub fn list_all(&self, periods: &[i64], now: i64, interpolate: bool) -> Vec<(String, Vec<f64>)> {
        self.storage.read().sums_per_period(periods, now, interpolate)
    }

    /// Runs a wildcard grouping query. See
    /// [`Storage::sum_by_period_grouping_query`].
    pub fn group_query<S: AsRef<str>>(
        &self,
        patterns: &[S],
        periods: &[i64],
        now: i64,
        interpolate: bool,
    ) -> Vec<Vec<f64>> {
        self.storage
            .read()
            .sum_by_period_grouping_query(patterns, periods, now, interpolate)
    }

    /// Removes stale metrics and returns how many were removed.
    pub fn prune(&self, now: i64) -> usize {
        self.storage.write().prune_stale(now).len()
    }

    /// Saves a snapshot of the whole index to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.storage.write().save_snapshot(path)
    }

    /// Replaces the whole index with the snapshot at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read; the index is then
    /// left unchanged.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        // Decode before taking the write lock so ingest is not blocked on I/O
        let snapshot = crate::snapshot::read(path)?;
        self.storage.write().install_snapshot(snapshot, path);
        Ok(())
    }

    /// Runs `f` with shared access to the index.
    pub fn with_storage<R>(&self, f: impl FnOnce(&Storage) -> R) -> R {
        f(&self.storage.read())
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("storage", &self.storage)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
