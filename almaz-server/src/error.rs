//! Startup errors for the almaz daemon.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that abort daemon startup.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The storage configuration or the startup snapshot load failed.
    #[error(transparent)]
    Store(#[from] almaz::AlmazError),

    /// An acceptance regex failed to compile.
    #[error("invalid acceptance regex '{pattern}'")]
    Regex {
        /// The pattern as given on the command line.
        pattern: String,
        /// The underlying compile error.
        #[source]
        source: regex::Error,
    },

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread")]
    Spawn {
        /// The thread name.
        name: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The SIGINT/SIGTERM handler could not be installed.
    #[error("failed to install shutdown handler")]
    Signal {
        /// The underlying error.
        #[source]
        source: ctrlc::Error,
    },
}
