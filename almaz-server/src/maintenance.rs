//! Background tasks: periodic snapshots, pruning, audit logging, and the
//! final snapshot on shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use almaz::Coordinator;

use crate::api::unix_now;
use crate::error::ServerError;

/// Interval between audit log lines.
pub const AUDIT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns a named thread that runs `task` every `interval`, forever.
///
/// # Errors
///
/// Returns [`ServerError::Spawn`] if the thread cannot be created.
pub fn spawn_periodic<F>(
    name: &'static str,
    interval: Duration,
    mut task: F,
) -> Result<JoinHandle<()>, ServerError>
where
    F: FnMut() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("almaz-{name}"))
        .spawn(move || {
            loop {
                std::thread::sleep(interval);
                task();
            }
        })
        .map_err(|source| ServerError::Spawn { name, source })
}

/// Writes a snapshot of the whole index to `path`, logging the outcome.
/// Returns true if the snapshot was written.
pub fn save_snapshot(coordinator: &Coordinator, path: &Path) -> bool {
    let started = Instant::now();
    match coordinator.save(path) {
        Ok(()) => {
            tracing::info!(
                path = %path.display(),
                metrics = coordinator.metric_count(),
                "snapshot saved in {:?}",
                started.elapsed()
            );
            true
        }
        Err(e) => {
            tracing::error!(path = %path.display(), "snapshot save failed: {e}");
            false
        }
    }
}

/// Installs a SIGINT/SIGTERM handler that writes a final snapshot to
/// `path` and exits. The exit status is non-zero if the save failed.
///
/// # Errors
///
/// Returns [`ServerError::Signal`] if a handler is already installed or
/// cannot be registered.
pub fn install_shutdown_save(
    coordinator: &Arc<Coordinator>,
    path: PathBuf,
) -> Result<(), ServerError> {
    let coordinator = Arc::clone(coordinator);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested, saving snapshot");
        let code = if save_snapshot(&coordinator, &path) { 0 } else { 1 };
        std::process::exit(code);
    })
    .map_err(|source| ServerError::Signal { source })
}

/// Removes stale metrics as of `now`, logging how many went away.
pub fn prune_stale(coordinator: &Coordinator, now: i64) -> usize {
    let removed = coordinator.prune(now);
    if removed > 0 {
        tracing::info!(removed, remaining = coordinator.metric_count(), "pruned stale metrics");
    }
    removed
}

/// Starts the snapshot thread. `interval` of zero disables it.
///
/// # Errors
///
/// Returns [`ServerError::Spawn`] if the thread cannot be created.
pub fn start_bgsave(
    coordinator: &Arc<Coordinator>,
    path: PathBuf,
    interval: Duration,
) -> Result<Option<JoinHandle<()>>, ServerError> {
    if interval.is_zero() {
        return Ok(None);
    }
    let coordinator = Arc::clone(coordinator);
    spawn_periodic("bgsave", interval, move || {
        save_snapshot(&coordinator, &path);
    })
    .map(Some)
}

/// Starts the pruning thread. `interval` of zero disables it.
///
/// # Errors
///
/// Returns [`ServerError::Spawn`] if the thread cannot be created.
pub fn start_prune(
    coordinator: &Arc<Coordinator>,
    interval: Duration,
) -> Result<Option<JoinHandle<()>>, ServerError> {
    if interval.is_zero() {
        return Ok(None);
    }
    let coordinator = Arc::clone(coordinator);
    spawn_periodic("prune", interval, move || {
        prune_stale(&coordinator, unix_now());
    })
    .map(Some)
}

/// Starts the audit thread, logging the metric count every
/// [`AUDIT_INTERVAL`].
///
/// # Errors
///
/// Returns [`ServerError::Spawn`] if the thread cannot be created.
pub fn start_audit(coordinator: &Arc<Coordinator>) -> Result<JoinHandle<()>, ServerError> {
    let coordinator = Arc::clone(coordinator);
    spawn_periodic("audit", AUDIT_INTERVAL, move || {
        tracing::info!("audit: metric number = {}", coordinator.metric_count());
    })
}
