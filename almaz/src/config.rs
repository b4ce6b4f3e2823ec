//! Storage configuration for almaz.
//!
//! A [`StorageConfig`] fixes the bucket width (precision) and retention of
//! every metric created while it is in effect. Metrics keep the shape they
//! were created with; changing the configuration later never resizes them.

use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Maximum number of buckets allowed in a single metric ring.
///
/// Each bucket is an `f32`, so this caps a ring at 40 MB.
pub const MAX_RETENTION_BUCKETS: u64 = 10_000_000;

/// Default bucket width: one minute.
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(60);

/// Default retention: one day.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Bucket width and retention applied to newly created metrics.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use almaz::config::StorageConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // 10 second buckets kept for one hour
/// let config = StorageConfig::new(Duration::from_secs(10), Duration::from_secs(3600))?;
/// assert_eq!(config.retention_buckets(), 360);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    /// Width of a single bucket. Must be a whole, non-zero number of seconds.
    pub bucket_width: Duration,

    /// How far back the ring reaches. Must be a whole multiple of
    /// `bucket_width`.
    pub retention: Duration,
}

impl StorageConfig {
    /// Creates and validates a storage configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the bucket width or retention would produce
    /// an empty, fractional, or oversized ring.
    pub fn new(bucket_width: Duration, retention: Duration) -> Result<Self> {
        let config = Self {
            bucket_width,
            retention,
        };
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration from the daemon's command-line units:
    /// retention in hours and precision in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the resulting configuration is invalid.
    pub fn from_hours_and_seconds(retention_hours: u64, precision_seconds: u64) -> Result<Self> {
        Self::new(
            Duration::from_secs(precision_seconds),
            Duration::from_secs(retention_hours.saturating_mul(3600)),
        )
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_width.is_zero() {
            return Err(ConfigError::InvalidBucketWidth {
                width: self.bucket_width,
                reason: "bucket width cannot be zero".to_string(),
            }
            .into());
        }

        if self.bucket_width.subsec_nanos() != 0 {
            return Err(ConfigError::InvalidBucketWidth {
                width: self.bucket_width,
                reason: "bucket width must be a whole number of seconds".to_string(),
            }
            .into());
        }

        if self.bucket_width.as_secs() > i64::MAX as u64 {
            return Err(ConfigError::InvalidBucketWidth {
                width: self.bucket_width,
                reason: "bucket width is too large".to_string(),
            }
            .into());
        }

        if self.retention.is_zero() {
            return Err(ConfigError::InvalidRetention {
                retention: self.retention,
                reason: "retention cannot be zero".to_string(),
            }
            .into());
        }

        if self.retention < self.bucket_width {
            return Err(ConfigError::InvalidRetention {
                retention: self.retention,
                reason: format!(
                    "retention must be >= bucket width ({:?})",
                    self.bucket_width
                ),
            }
            .into());
        }

        if self.retention.as_nanos() % self.bucket_width.as_nanos() != 0 {
            return Err(ConfigError::InvalidRetention {
                retention: self.retention,
                reason: format!(
                    "retention must be a multiple of bucket width ({:?})",
                    self.bucket_width
                ),
            }
            .into());
        }

        let buckets = self.retention.as_secs() / self.bucket_width.as_secs();
        if buckets > MAX_RETENTION_BUCKETS {
            return Err(ConfigError::TooManyBuckets {
                retention: self.retention,
                width: self.bucket_width,
                buckets,
                max_buckets: MAX_RETENTION_BUCKETS,
            }
            .into());
        }

        Ok(())
    }

    /// Bucket width in whole seconds.
    #[allow(clippy::cast_possible_wrap)] // validate() bounds the width to i64::MAX
    pub fn bucket_width_secs(&self) -> i64 {
        self.bucket_width.as_secs() as i64
    }

    /// Number of buckets in a ring created with this configuration.
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_RETENTION_BUCKETS
    pub fn retention_buckets(&self) -> usize {
        let width = self.bucket_width.as_secs();
        if width == 0 {
            return 0;
        }
        (self.retention.as_secs() / width) as usize
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket_width: DEFAULT_BUCKET_WIDTH,
            retention: DEFAULT_RETENTION,
        }
    }
}
