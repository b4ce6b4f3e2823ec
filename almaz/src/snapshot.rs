//! Whole-index snapshot persistence.
//!
//! The full metric index is encoded with `bincode` into a single file. There
//! is no streaming or partial format: a snapshot always holds every metric.
//!
//! # Atomicity
//!
//! [`write_atomic`] writes to a hidden temporary file in the destination's
//! directory, syncs it, and renames it over the destination. On any failure
//! the temporary file is removed and the previous snapshot stays intact.
//! [`read`] fully decodes and validates a snapshot before returning it, so a
//! caller replacing its index with the result never observes a partial load.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};

/// Serialized state of a single metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// The metric name.
    pub name: String,
    /// Bucket width in seconds.
    pub bucket_width_secs: i64,
    /// Number of buckets in the ring.
    pub retention_buckets: usize,
    /// Ring contents in storage order (not time order).
    pub ring: Vec<f32>,
    /// Position of the head bucket in `ring`.
    pub head_index: usize,
    /// Bucket key of the head bucket.
    pub head_bucket_key: i64,
    /// Lifetime total.
    pub total: f64,
}

impl MetricSnapshot {
    /// Checks the record for internal consistency.
    fn validate(&self) -> std::result::Result<(), String> {
        if self.bucket_width_secs <= 0 {
            return Err(format!("bucket width {} must be > 0", self.bucket_width_secs));
        }
        if self.ring.is_empty() {
            return Err("ring is empty".to_string());
        }
        if self.ring.len() != self.retention_buckets {
            return Err(format!(
                "ring has {} buckets, expected {}",
                self.ring.len(),
                self.retention_buckets
            ));
        }
        if self.head_index >= self.ring.len() {
            return Err(format!(
                "head index {} out of range for {} buckets",
                self.head_index,
                self.ring.len()
            ));
        }
        Ok(())
    }
}

/// Serialized state of the whole index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Every metric in the index.
    pub metrics: Vec<MetricSnapshot>,
}

/// Returns the temporary path used while writing `path`.
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map_or_else(|| "snapshot".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

/// Writes `snapshot` to `path` atomically.
///
/// # Errors
///
/// Returns [`SnapshotError`] if the temporary file cannot be written or
/// encoded, or the rename fails. The destination is untouched in every
/// error case.
pub fn write_atomic<P: AsRef<Path>>(snapshot: &StorageSnapshot, path: P) -> Result<()> {
    let path = path.as_ref();
    let tmp = temp_path(path);

    if let Err(e) = write_file(snapshot, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(SnapshotError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        }
        .into());
    }

    Ok(())
}

fn write_file(snapshot: &StorageSnapshot, tmp: &Path) -> Result<()> {
    let write_err = |source| SnapshotError::Write {
        path: tmp.to_path_buf(),
        source,
    };

    let file = File::create(tmp).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, snapshot)
        .map_err(|source| SnapshotError::Encode { source })?;
    writer.flush().map_err(write_err)?;

    let file = writer
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;
    Ok(())
}

/// Reads and validates a snapshot from `path`.
///
/// # Errors
///
/// Returns [`SnapshotError`] if the file is missing or unreadable, cannot be
/// decoded, or contains an inconsistent metric record.
pub fn read<P: AsRef<Path>>(path: P) -> Result<StorageSnapshot> {
    let path = path.as_ref();

    // Decoding from a slice bounds every length prefix by the file size
    let bytes = fs::read(path).map_err(|source| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: StorageSnapshot = bincode::deserialize(&bytes)
        .map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    for metric in &snapshot.metrics {
        metric.validate().map_err(|reason| SnapshotError::Corrupted {
            path: path.to_path_buf(),
            metric: metric.name.clone(),
            reason,
        })?;
    }

    Ok(snapshot)
}
