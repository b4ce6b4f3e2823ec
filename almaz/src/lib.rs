//! # almaz
//!
//! In-memory round-robin metrics store with wildcard period queries.
//!
//! almaz accepts a continuous stream of `(name, value, timestamp)` samples,
//! accumulates them into fixed-precision, fixed-retention ring buffers, and
//! answers trailing-window sums, including sums grouped across many metrics
//! by dot-segmented wildcard patterns.
//!
//! ## Key Properties
//!
//! - One fixed-size ring of `f32` bucket sums per metric, sized at creation
//! - Late writes land in their bucket while still retained
//! - A lifetime total per metric, independent of retention
//! - All trailing windows of a query computed in one sweep
//! - Whole-index snapshots written atomically (temp file + rename)
//! - Two lock tiers: one structural lock, one lock per metric
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use almaz::{Coordinator, StorageConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 1 minute buckets kept for 24 hours
//! let config = StorageConfig::new(Duration::from_secs(60), Duration::from_secs(86_400))?;
//! let coordinator = Coordinator::new(config);
//!
//! // Ingest samples
//! coordinator.store("stats.web1.requests", 12.0, 1_700_000_000);
//! coordinator.store("stats.web2.requests", 30.0, 1_700_000_005);
//!
//! // Sum the last minute and the last hour, grouped by pattern
//! let rows = coordinator.group_query(&["stats.*.requests"], &[60, 3600], 1_700_000_010, false);
//! println!("requests: {:?}", rows[0]);
//!
//! // Persist and restore
//! coordinator.save("./almaz.dat")?;
//! coordinator.load("./almaz.dat")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Coordinator`] - Owns the structural lock; ingest, queries, maintenance
//! - [`Storage`] - Name to metric index, grouping queries, pruning
//! - [`Metric`] - A single ring buffer with its own lock
//! - [`StorageConfig`] - Bucket width and retention for new metrics
//!
//! ## Modules
//!
//! - [`coordinator`] - Structural locking, update listeners, line parsing
//! - [`storage`] - Metric index
//! - [`metric`] - Ring buffer time series
//! - [`pattern`] - Wildcard pattern matching
//! - [`snapshot`] - Snapshot file format and atomic writes
//! - [`config`] - Storage configuration
//! - [`error`] - Error types

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metric;
pub mod pattern;
pub mod snapshot;
pub mod storage;

// Re-export primary API types at crate root for convenience.
pub use config::StorageConfig;
pub use coordinator::{Coordinator, Observation, UpdateListener};
pub use error::{AlmazError, Result};
pub use metric::Metric;
pub use pattern::MetricPattern;
pub use storage::Storage;
