//! Error kinds surfaced by the passer.
//!
//! Transient transport conditions (would-block, descriptor-table-full) are
//! absorbed internally by the queues and the retry timer and never appear
//! here.

use std::fmt;
use std::io;

/// Error reported by passer operations, recv waiters, send completions, and
/// the `on_error` callback.
#[derive(Debug)]
pub enum PasserError {
    /// Unrecoverable transport failure. Terminal for the passer.
    Io(io::Error),
    /// The peer closed its endpoint cleanly.
    Closed,
    /// The passer was shut down; pending work was abandoned.
    ShutDown,
    /// API misuse: role selection skipped, repeated, or applied to the wrong
    /// construction. Surfaced synchronously, never via callbacks.
    Programmer(&'static str),
}

impl PasserError {
    /// Whether this error represents a clean peer-initiated close.
    pub fn is_orderly(&self) -> bool {
        matches!(self, PasserError::Closed)
    }
}

impl fmt::Display for PasserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasserError::Io(e) => write!(f, "transport error: {e}"),
            PasserError::Closed => write!(f, "peer closed the endpoint"),
            PasserError::ShutDown => write!(f, "passer shut down"),
            PasserError::Programmer(msg) => write!(f, "API misuse: {msg}"),
        }
    }
}

impl std::error::Error for PasserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PasserError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PasserError {
    fn from(e: io::Error) -> Self {
        PasserError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = PasserError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        let s = format!("{err}");
        assert!(s.contains("boom"));
    }

    #[test]
    fn orderly_close_is_distinguished() {
        assert!(PasserError::Closed.is_orderly());
        assert!(!PasserError::ShutDown.is_orderly());
        assert!(!PasserError::Programmer("x").is_orderly());
    }

    #[test]
    fn io_source_is_preserved() {
        use std::error::Error;
        let err = PasserError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.source().is_some());
    }
}
