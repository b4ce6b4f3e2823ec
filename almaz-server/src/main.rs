//! almaz daemon: Carbon-compatible metric ingest with an HTTP query API.
//!
//! Accepts `<name> <value> <timestamp>` lines over TCP, keeps them in an
//! in-memory almaz store, and answers trailing-window sums over HTTP.
//! With `--persist` it loads a snapshot at startup, saves one on SIGINT or
//! SIGTERM, and optionally saves periodically.

mod api;
mod error;
mod ingest;
mod maintenance;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use almaz::{Coordinator, StorageConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::error::ServerError;
use crate::ingest::{AcceptanceFilter, TracingListener};

/// almaz-server: in-memory round-robin metrics daemon.
#[derive(Parser, Debug)]
#[command(name = "almaz-server", version, about)]
struct Cli {
    /// Address to listen on for metrics (Carbon plaintext protocol).
    #[arg(long, default_value = "0.0.0.0:7701")]
    address: SocketAddr,

    /// Address to serve HTTP queries on.
    #[arg(long, default_value = "0.0.0.0:7702")]
    http_address: SocketAddr,

    /// Load the snapshot at startup and save it on shutdown.
    #[arg(long)]
    persist: bool,

    /// Path to the snapshot file.
    #[arg(long, default_value = "almaz.dat")]
    persist_path: PathBuf,

    /// Save a snapshot every N seconds (0 disables). Requires --persist.
    #[arg(long, default_value = "0")]
    bgsave: u64,

    /// Keep metrics for the last N hours.
    #[arg(long, default_value = "24")]
    duration_in_hours: u64,

    /// Bucket precision in seconds.
    #[arg(long, default_value = "60")]
    precision_in_seconds: u64,

    /// Accept only metrics matching this regular expression (repeatable).
    #[arg(long = "regex")]
    regex: Vec<String>,

    /// Log the metric count periodically.
    #[arg(long)]
    audit: bool,

    /// Remove stale metrics every N seconds (0 disables).
    #[arg(long, default_value = "300")]
    prune_interval: u64,

    /// Print additional info.
    #[arg(long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("almaz-server failed: {e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ServerError> {
    let config = StorageConfig::from_hours_and_seconds(cli.duration_in_hours, cli.precision_in_seconds)?;
    tracing::info!(
        precision_secs = config.bucket_width_secs(),
        buckets = config.retention_buckets(),
        "storage configured"
    );

    let filter = Arc::new(AcceptanceFilter::new(&cli.regex)?);
    if !filter.is_empty() {
        tracing::info!(count = filter.len(), "acceptance regexen configured");
    }

    let coordinator = Coordinator::new(config).with_listener(Arc::new(TracingListener));
    if cli.persist {
        if cli.persist_path.exists() {
            coordinator.load(&cli.persist_path)?;
        } else {
            tracing::info!(path = %cli.persist_path.display(), "no snapshot found, starting empty");
        }
    }
    let coordinator = Arc::new(coordinator);

    let ingest_listener = bind(cli.address)?;
    let http_listener = bind(cli.http_address)?;

    if cli.persist {
        maintenance::start_bgsave(
            &coordinator,
            cli.persist_path.clone(),
            Duration::from_secs(cli.bgsave),
        )?;
        maintenance::install_shutdown_save(&coordinator, cli.persist_path.clone())?;
    } else if cli.bgsave > 0 {
        tracing::warn!("--bgsave has no effect without --persist");
    }
    maintenance::start_prune(&coordinator, Duration::from_secs(cli.prune_interval))?;
    if cli.audit {
        maintenance::start_audit(&coordinator)?;
    }

    let http_coordinator = Arc::clone(&coordinator);
    std::thread::Builder::new()
        .name("almaz-http".to_string())
        .spawn(move || api::run_api_server(http_listener, http_coordinator))
        .map_err(|source| ServerError::Spawn { name: "http", source })?;
    tracing::info!("http interface available at {}", cli.http_address);

    tracing::info!("listening on {}", cli.address);
    ingest::run_ingest_listener(ingest_listener, coordinator, filter);
    Ok(())
}

fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["almaz-server"]).unwrap();
        assert_eq!(cli.address, "0.0.0.0:7701".parse().unwrap());
        assert_eq!(cli.http_address, "0.0.0.0:7702".parse().unwrap());
        assert!(!cli.persist);
        assert_eq!(cli.persist_path, PathBuf::from("almaz.dat"));
        assert_eq!(cli.bgsave, 0);
        assert_eq!(cli.duration_in_hours, 24);
        assert_eq!(cli.precision_in_seconds, 60);
        assert!(cli.regex.is_empty());
        assert_eq!(cli.prune_interval, 300);
    }

    #[test]
    fn test_repeatable_regex() {
        let cli =
            Cli::try_parse_from(["almaz-server", "--regex", "^a\\.", "--regex", "^b\\."]).unwrap();
        assert_eq!(cli.regex, vec!["^a\\.".to_string(), "^b\\.".to_string()]);
    }

    #[test]
    fn test_invalid_storage_config_aborts() {
        let cli = Cli::try_parse_from(["almaz-server", "--precision-in-seconds", "0"]).unwrap();
        let err = run(cli).unwrap_err();
        assert!(matches!(err, ServerError::Store(_)));
    }

    #[test]
    fn test_invalid_regex_aborts() {
        let cli = Cli::try_parse_from(["almaz-server", "--regex", "("]).unwrap();
        let err = run(cli).unwrap_err();
        assert!(matches!(err, ServerError::Regex { .. }));
    }

    #[test]
    fn test_corrupt_snapshot_aborts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("almaz.dat");
        std::fs::write(&path, b"garbage").unwrap();

        let cli = Cli::try_parse_from([
            "almaz-server",
            "--persist",
            "--persist-path",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let err = run(cli).unwrap_err();
        assert!(matches!(err, ServerError::Store(_)));
    }
}
