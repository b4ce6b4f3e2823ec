//! Carbon line-protocol ingest.
//!
//! Each TCP connection gets its own thread. Every line is parsed as
//! `<name> <value> <timestamp>`; malformed lines are skipped, and names that
//! fail the acceptance filter are dropped.

use std::io::{BufRead, BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Instant;

use almaz::{Coordinator, Observation, UpdateListener};
use regex::Regex;

use crate::error::ServerError;

/// Acceptance filter over metric names.
///
/// An empty filter accepts everything; otherwise a name is accepted when
/// any of the expressions matches it.
#[derive(Debug, Default)]
pub struct AcceptanceFilter {
    regexen: Vec<Regex>,
}

impl AcceptanceFilter {
    /// Compiles the given expressions.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Regex`] for the first expression that does not
    /// compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ServerError> {
        let regexen = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ServerError::Regex {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { regexen })
    }

    /// Returns true if `name` should be stored.
    pub fn accepts(&self, name: &str) -> bool {
        self.regexen.is_empty() || self.regexen.iter().any(|rx| rx.is_match(name))
    }

    /// Number of configured expressions.
    pub fn len(&self) -> usize {
        self.regexen.len()
    }

    /// Returns true if no expressions are configured.
    pub fn is_empty(&self) -> bool {
        self.regexen.is_empty()
    }
}

/// Per-connection ingest counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    /// Lines stored.
    pub accepted: u64,
    /// Well-formed lines rejected by the acceptance filter.
    pub filtered: u64,
    /// Lines that did not parse.
    pub malformed: u64,
}

/// Logs every accepted write at trace level.
#[derive(Debug, Default)]
pub struct TracingListener;

impl UpdateListener for TracingListener {
    fn on_update(&self, name: &str, value: f32, total: f64) {
        tracing::trace!(metric = name, value, total, "metric updated");
    }
}

/// Accepts connections forever, one thread per connection.
pub fn run_ingest_listener(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    filter: Arc<AcceptanceFilter>,
) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("ingest accept error: {e}");
                continue;
            }
        };

        let coordinator = Arc::clone(&coordinator);
        let filter = Arc::clone(&filter);
        let spawned = std::thread::Builder::new()
            .name("almaz-ingest-conn".to_string())
            .spawn(move || handle_connection(stream, &coordinator, &filter));
        if let Err(e) = spawned {
            tracing::error!("failed to spawn connection thread: {e}");
        }
    }
}

fn handle_connection(stream: TcpStream, coordinator: &Coordinator, filter: &AcceptanceFilter) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
    let started = Instant::now();

    let stats = ingest_lines(BufReader::new(stream), coordinator, filter);

    tracing::debug!(
        peer = %peer,
        accepted = stats.accepted,
        filtered = stats.filtered,
        malformed = stats.malformed,
        "processed metrics batch in {:?}",
        started.elapsed()
    );
}

/// Longest accepted line, newline included. Longer lines count as malformed.
pub const MAX_LINE_BYTES: u64 = 4096;

/// Reads lines until EOF or a read error and stores the accepted ones.
///
/// Lines that are not UTF-8 or exceed [`MAX_LINE_BYTES`] are counted as
/// malformed and skipped; the rest of the connection is still processed.
pub fn ingest_lines<R: BufRead>(
    mut reader: R,
    coordinator: &Coordinator,
    filter: &AcceptanceFilter,
) -> IngestStats {
    let mut stats = IngestStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = match reader
            .by_ref()
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
        {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("ingest read error: {e}");
                break;
            }
        };

        if buf.last() != Some(&b'\n') && read as u64 >= MAX_LINE_BYTES {
            tracing::debug!("line exceeds {MAX_LINE_BYTES} bytes, skipping");
            stats.malformed += 1;
            if let Err(e) = reader.skip_until(b'\n') {
                tracing::debug!("ingest read error: {e}");
                break;
            }
            continue;
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            tracing::debug!("non-utf8 line: {:?}", String::from_utf8_lossy(&buf));
            stats.malformed += 1;
            continue;
        };

        let Some(observation) = Observation::parse_line(line) else {
            if !line.trim().is_empty() {
                tracing::debug!("parse error: {line:?}");
                stats.malformed += 1;
            }
            continue;
        };

        if filter.accepts(&observation.name) {
            coordinator.store(&observation.name, observation.value, observation.timestamp);
            stats.accepted += 1;
        } else {
            stats.filtered += 1;
        }
    }

    stats
}
