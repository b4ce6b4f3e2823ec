//! Error types for the almaz metrics store.
//!
//! Only configuration and snapshot I/O can fail. Late, future, and
//! out-of-window writes are absorbed by the ring buffers and never surface
//! here.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all almaz operations.
#[derive(Error, Debug)]
pub enum AlmazError {
    /// The storage configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Saving or loading a snapshot failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Errors raised while validating a [`StorageConfig`](crate::config::StorageConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The bucket width is zero or not a whole number of seconds.
    #[error("invalid bucket width {width:?}: {reason}")]
    InvalidBucketWidth {
        /// The rejected bucket width.
        width: Duration,
        /// Why it was rejected.
        reason: String,
    },

    /// The retention is zero, shorter than a bucket, or not a multiple of it.
    #[error("invalid retention {retention:?}: {reason}")]
    InvalidRetention {
        /// The rejected retention.
        retention: Duration,
        /// Why it was rejected.
        reason: String,
    },

    /// Retention divided by bucket width yields an unreasonably large ring.
    #[error("retention {retention:?} / bucket width {width:?} gives {buckets} buckets (max {max_buckets})")]
    TooManyBuckets {
        /// The configured retention.
        retention: Duration,
        /// The configured bucket width.
        width: Duration,
        /// The computed bucket count.
        buckets: u64,
        /// The maximum allowed bucket count.
        max_buckets: u64,
    },
}

/// Errors raised while writing or reading a snapshot file.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The snapshot file could not be opened or read.
    #[error("failed to read snapshot '{}': {source}", path.display())]
    Read {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The temporary snapshot file could not be created, written, or synced.
    #[error("failed to write snapshot '{}': {source}", path.display())]
    Write {
        /// The temporary file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The temporary file could not be renamed over the destination.
    #[error("failed to rename '{}' to '{}': {source}", from.display(), to.display())]
    Rename {
        /// The temporary file path.
        from: PathBuf,
        /// The destination path.
        to: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding the index failed.
    #[error("failed to encode snapshot: {source}")]
    Encode {
        /// The underlying bincode error.
        #[source]
        source: bincode::Error,
    },

    /// The snapshot file could not be decoded.
    #[error("failed to decode snapshot '{}': {source}", path.display())]
    Decode {
        /// The snapshot path.
        path: PathBuf,
        /// The underlying bincode error.
        #[source]
        source: bincode::Error,
    },

    /// The snapshot decoded but a metric record is internally inconsistent.
    #[error("snapshot '{}' is corrupted: metric '{metric}': {reason}", path.display())]
    Corrupted {
        /// The snapshot path.
        path: PathBuf,
        /// The offending metric name.
        metric: String,
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Type alias for `Result<T, AlmazError>`.
pub type Result<T> = std::result::Result<T, AlmazError>;
