//! Error types shared across the service.
//!
//! Per-connection failures (`Io`, `LogClosed`) stay inside the worker that
//! hit them. `Setup` and `Config` errors abort startup. `Cleanup` errors are
//! logged during shutdown and never change the exit status.

use crate::config::ConfigError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Read/write/accept failure scoped to a single connection or append.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The shared log has already been closed by the shutdown sequence.
    #[error("log is closed")]
    LogClosed,

    /// No room left in the worker registry for another worker.
    #[error("worker registry is full ({0} workers)")]
    RegistryFull(usize),

    /// Bind, listen, log-open or signal registration failed at startup.
    #[error("{context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The persisted log could not be removed at shutdown.
    #[error("failed to remove log file '{}': {source}", .path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn setup(context: impl Into<String>, source: io::Error) -> Self {
        Error::Setup {
            context: context.into(),
            source,
        }
    }

    /// Whether the error ends the process during startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Setup { .. } | Error::Config(_))
    }
}
