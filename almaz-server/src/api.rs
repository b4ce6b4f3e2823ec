//! Plain-text HTTP query interface.
//!
//! Uses `std::net::TcpListener`; no external HTTP framework needed.
//! Every route is also served under the `/almaz` prefix.
//!
//! - `GET /` - metric count
//! - `GET /list/all` - trailing sums for every metric
//! - `GET /list/all-interpolated` - same, with interpolation
//! - `POST /list/group` - first body line holds the periods, every further
//!   line a wildcard pattern; interpolated
//! - `POST /load/totals` - `<name> <total>` lines overwriting lifetime totals
//!
//! Result rows are tab-separated: the name or pattern, then one sum per
//! period with six decimals.

use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use almaz::Coordinator;

/// Periods reported by the list endpoints: 1m, 15m, 1h, 4h, 24h.
pub const DEFAULT_PERIODS: [i64; 5] = [60, 900, 3600, 14_400, 86_400];

const PATH_PREFIX: &str = "/almaz";
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Request body, lossily decoded as UTF-8.
    pub body: String,
}

/// A plain-text HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl Response {
    fn ok(body: String) -> Self {
        Self { status: 200, body }
    }

    fn bad_request(body: String) -> Self {
        Self { status: 400, body }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            body: "404 page not found\n".to_string(),
        }
    }
}

/// Runs the HTTP API server (blocking; intended for a dedicated thread).
pub fn run_api_server(listener: TcpListener, coordinator: Arc<Coordinator>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept error: {e}");
                continue;
            }
        };

        // Set a short read timeout so we don't block forever on slow clients
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

        if let Err(e) = handle_connection(&stream, &coordinator) {
            tracing::debug!("request error: {e}");
        }
    }
}

fn handle_connection(
    stream: &TcpStream,
    coordinator: &Coordinator,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match read_request(BufReader::new(stream))? {
        Some(request) => {
            tracing::debug!(method = %request.method, path = %request.path, "http request");
            route(&request, coordinator, unix_now())
        }
        None => Response::bad_request("400 Bad Request\n".to_string()),
    };
    send_response(stream, &response)
}

/// Reads one request: request line, headers, and a `Content-Length` body.
///
/// Returns `Ok(None)` when the request line is malformed.
///
/// # Errors
///
/// Returns an I/O error if the stream fails mid-request.
pub fn read_request<R: BufRead>(mut reader: R) -> std::io::Result<Option<Request>> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Parse: "GET /path?query HTTP/1.x"
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let path = target.split_once('?').map_or(target, |(p, _)| p);

    let mut content_length: u64 = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = Vec::new();
    reader
        .take(content_length.min(MAX_BODY_BYTES))
        .read_to_end(&mut body)?;

    Ok(Some(Request {
        method: method.to_string(),
        path: path.to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
}

/// Dispatches a request to its handler.
pub fn route(request: &Request, coordinator: &Coordinator, now: i64) -> Response {
    let path = request.path.strip_prefix(PATH_PREFIX).unwrap_or(&request.path);
    let path = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };

    match path {
        "/" => Response::ok(format!("Metrics count: {}\n", coordinator.metric_count())),
        "/list/all" => list_all(coordinator, now, false),
        "/list/all-interpolated" => list_all(coordinator, now, true),
        "/list/group" => list_group(coordinator, &request.body, now),
        "/load/totals" => load_totals(coordinator, &request.body),
        _ => Response::not_found(),
    }
}

fn list_all(coordinator: &Coordinator, now: i64, interpolate: bool) -> Response {
    let mut body = String::new();
    for (name, sums) in coordinator.list_all(&DEFAULT_PERIODS, now, interpolate) {
        push_row(&mut body, &name, &sums);
    }
    Response::ok(body)
}

fn list_group(coordinator: &Coordinator, body: &str, now: i64) -> Response {
    let mut lines = body.lines();
    let periods_line = lines.next().map(str::trim).unwrap_or_default();
    if periods_line.is_empty() {
        return Response::bad_request(
            "400 Bad Request\r\nUse POST method and specify period durations in seconds \
             on the first line of request data.\n"
                .to_string(),
        );
    }

    let mut periods = Vec::new();
    for token in periods_line.split_whitespace() {
        match token.parse::<i64>() {
            Ok(p) if p >= 0 => periods.push(p),
            Ok(p) => {
                return Response::bad_request(format!(
                    "400 Bad Request\r\nperiod must be non-negative, got {p}\n"
                ));
            }
            Err(e) => {
                return Response::bad_request(format!(
                    "400 Bad Request\r\ninvalid period {token:?}: {e}\n"
                ));
            }
        }
    }

    let patterns: Vec<&str> = lines.map(str::trim).filter(|l| !l.is_empty()).collect();
    let results = coordinator.group_query(&patterns, &periods, now, true);

    let mut out = String::new();
    for (pattern, sums) in patterns.iter().zip(&results) {
        push_row(&mut out, pattern, sums);
    }
    Response::ok(out)
}

fn load_totals(coordinator: &Coordinator, body: &str) -> Response {
    let mut out = String::new();
    let mut loaded = 0_usize;

    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.trim().split(' ');
        let (Some(name), Some(total), None) = (parts.next(), parts.next(), parts.next()) else {
            let _ = write!(out, "error in line {line}: expected '<name> <total>'\r\n");
            continue;
        };
        match total.parse::<f64>() {
            Ok(total) => {
                coordinator.set_total(name, total);
                loaded += 1;
            }
            Err(e) => {
                let _ = write!(out, "error in line {line}: {e}\r\n");
            }
        }
    }

    tracing::info!(loaded, "loaded totals");
    out.push_str("load complete\r\n");
    Response::ok(out)
}

fn push_row(out: &mut String, label: &str, sums: &[f64]) {
    out.push_str(label);
    for sum in sums {
        let _ = write!(out, "\t{sum:.6}");
    }
    out.push('\n');
}

/// Sends a plain-text HTTP response.
fn send_response(
    mut stream: &TcpStream,
    response: &Response,
) -> Result<(), Box<dyn std::error::Error>> {
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    write!(
        stream,
        "HTTP/1.1 {} {status_text}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        response.body.len(),
        response.body,
    )?;

    Ok(())
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
