//! Error types for listener handover and shutdown.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraceError>;

/// Errors raised while acquiring, serving, restarting or draining a listener.
#[derive(Debug, Error)]
pub enum GraceError {
    /// Accept or close attempted after the listener was shut down.
    ///
    /// The serve loop treats this as a normal end of serving.
    #[error("listener already closed")]
    AlreadyClosed,

    /// Reload requested while no listener is open.
    #[error("no listener for restart")]
    NoListenerForRestart,

    /// In-flight connections did not finish within the drain bound.
    #[error("listener close timed out after {timeout:?}")]
    DrainTimeout {
        /// The configured drain bound.
        timeout: Duration,
    },

    /// Spawning the replacement process failed.
    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] io::Error),

    /// The listen address could not be resolved.
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        /// Address as given by the caller.
        addr: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },

    /// Binding a fresh listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address as given by the caller.
        addr: String,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// Registering OS signal handlers failed.
    #[error("failed to register signal handler: {0}")]
    Signal(#[source] io::Error),

    /// Any other I/O error, propagated as-is.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl GraceError {
    /// Whether this error only reports that the listener is already closed.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, GraceError::AlreadyClosed)
    }
}
