//! CLI for the almaz metrics store.
//!
//! Provides commands for inspecting and querying almaz snapshot files, and
//! for benchmarking the ingest path.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};

use almaz::{Coordinator, Storage, StorageConfig};

/// almaz: in-memory round-robin metrics store CLI.
#[derive(Parser)]
#[command(name = "almaz", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display the metrics held in a snapshot file.
    Info {
        /// Path to the snapshot file.
        snapshot: PathBuf,
    },

    /// Run a grouping query against a snapshot file.
    Query {
        /// Path to the snapshot file.
        snapshot: PathBuf,

        /// Wildcard patterns (e.g. "stats.*.requests"). Lists every metric when empty.
        patterns: Vec<String>,

        /// Comma-separated trailing periods in seconds.
        #[arg(long, value_delimiter = ',', default_values_t = [60_i64, 900, 3600, 14_400, 86_400])]
        periods: Vec<i64>,

        /// Query time as a Unix timestamp (defaults to the current time).
        #[arg(long)]
        now: Option<i64>,

        /// Add the weighted partial bucket before each window.
        #[arg(long)]
        interpolate: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Run an ingest microbenchmark.
    Bench {
        /// Number of data points to write.
        #[arg(long, default_value = "1000000")]
        points: u64,

        /// Number of distinct metrics to write to.
        #[arg(long, default_value = "100")]
        metrics: u32,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { snapshot } => cmd_info(&snapshot),
        Commands::Query {
            snapshot,
            patterns,
            periods,
            now,
            interpolate,
            format,
        } => cmd_query(&snapshot, &patterns, &periods, now, interpolate, &format),
        Commands::Bench { points, metrics } => cmd_bench(points, metrics),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `almaz info <snapshot>`.
fn cmd_info(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = almaz::snapshot::read(path)?;
    let file_size = std::fs::metadata(path)?.len();

    println!("Snapshot: {}", path.display());
    println!("Size: {} ({file_size} bytes)", format_bytes(file_size));
    println!("Metrics: {}", snapshot.metrics.len());

    if snapshot.metrics.is_empty() {
        return Ok(());
    }
    println!();

    let mut metrics = snapshot.metrics;
    metrics.sort_by(|a, b| a.name.cmp(&b.name));

    for metric in &metrics {
        let width = u64::try_from(metric.bucket_width_secs).unwrap_or(0);
        let retention = width.saturating_mul(metric.retention_buckets as u64);
        println!("  - {}", metric.name);
        println!(
            "      precision={}, retention={} ({} buckets)",
            format_duration_secs(width),
            format_duration_secs(retention),
            metric.retention_buckets
        );
        println!(
            "      head_bucket={} (ts {}), total={}",
            metric.head_bucket_key,
            metric.head_bucket_key.saturating_mul(metric.bucket_width_secs),
            metric.total
        );
    }

    Ok(())
}

/// Implements `almaz query <snapshot> [patterns...]`.
fn cmd_query(
    path: &PathBuf,
    patterns: &[String],
    periods: &[i64],
    now: Option<i64>,
    interpolate: bool,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if periods.is_empty() {
        return Err("At least one period is required".into());
    }
    if let Some(bad) = periods.iter().find(|p| **p < 0) {
        return Err(format!("Period must be non-negative, got {bad}").into());
    }

    let mut storage = Storage::default();
    storage.load_snapshot(path)?;

    let now = match now {
        Some(ts) => ts,
        None => i64::try_from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_secs(),
        )?,
    };

    // Without patterns every metric gets its own row
    let rows: Vec<(String, Vec<f64>)> = if patterns.is_empty() {
        storage.sums_per_period(periods, now, interpolate)
    } else {
        let sums = storage.sum_by_period_grouping_query(patterns, periods, now, interpolate);
        patterns.iter().cloned().zip(sums).collect()
    };

    match format {
        OutputFormat::Csv => {
            println!("# now={now}, interpolate={interpolate}, rows={}", rows.len());
            let header: Vec<String> = periods.iter().map(|p| format!("sum_{p}s")).collect();
            println!("name,{}", header.join(","));
            for (name, sums) in &rows {
                let values: Vec<String> = sums.iter().map(|s| format!("{s}")).collect();
                println!("{name},{}", values.join(","));
            }
        }
        OutputFormat::Json => {
            let json_rows: Vec<serde_json::Value> = rows
                .iter()
                .map(|(name, sums)| {
                    serde_json::json!({
                        "name": name,
                        "sums": sums,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "now": now,
                "periods": periods,
                "interpolate": interpolate,
                "rows": json_rows,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `almaz bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(points: u64, metric_count: u32) -> Result<(), Box<dyn std::error::Error>> {
    if metric_count == 0 {
        return Err("--metrics must be at least 1".into());
    }

    println!("almaz ingest benchmark");
    println!("  Points: {points}");
    println!("  Metrics: {metric_count}");
    println!();

    let config = StorageConfig::new(Duration::from_secs(1), Duration::from_secs(3600))?;
    let coordinator = Coordinator::new(config);

    let names: Vec<String> = (0..metric_count)
        .map(|i| format!("bench.host{}.metric{i}", i % 10))
        .collect();

    println!("Writing {points} data points across {metric_count} metrics...");

    let mut ts: i64 = 1_700_000_000;
    let points_per_metric = points / u64::from(metric_count);

    let start = Instant::now();

    for _ in 0..points_per_metric {
        ts += 1;
        for (i, name) in names.iter().enumerate() {
            coordinator.store(name, i as f32, ts);
        }
    }

    let elapsed = start.elapsed();
    let total_writes = points_per_metric * u64::from(metric_count);
    let ns_per_write = elapsed.as_nanos() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    let query_start = Instant::now();
    let rows = coordinator.group_query(&["bench.*.*"], &[60, 900, 3600], ts, true);
    let query_elapsed = query_start.elapsed();

    println!();
    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Group query over {} metrics: {query_elapsed:.3?}", coordinator.metric_count());
    if let Some(hour) = rows.first().and_then(|r| r.get(2)) {
        println!("  Last hour sum: {hour}");
    }
    println!();

    Ok(())
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
