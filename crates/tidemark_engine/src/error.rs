//! Error types for the replication engine.

use thiserror::Error;
use tidemark_protocol::{Checkpoint, Direction};

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Conflicts are deliberately absent: a rejected write row is routed to
/// the conflict handler as a value and is never an error.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// Transient network fault. Retried with backoff, unbounded; never
    /// surfaced as fatal on its own.
    #[error("transient network error: {0}")]
    Network(String),

    /// Malformed or unexpected backend response. Retried a bounded
    /// number of times, then fatal.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Local storage failure. Fatal: the state machine transitions to
    /// errored and both engines halt.
    #[error("local storage error: {0}")]
    Storage(String),

    /// Invalid configuration, rejected at start before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplicationError {
    /// Returns true for faults that may be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Network(_) | ReplicationError::Protocol(_)
        )
    }

    /// Returns true for faults that retry without an attempt bound.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::Network(_))
    }

    /// Returns true for faults that halt replication immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::Storage(_) | ReplicationError::Configuration(_)
        )
    }
}

/// One engine failure, delivered as a value on the shared error channel.
///
/// Failures never cross an engine boundary as panics or silent halts;
/// the owner consumes this channel to observe retries and decide to
/// pause or stop independently of the await primitives.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Which direction failed.
    pub direction: Direction,
    /// The failure itself.
    pub error: ReplicationError,
    /// The checkpoint the failing cycle started from, if any.
    pub checkpoint: Option<Checkpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ReplicationError::Network("timeout".into()).is_transient());
        assert!(ReplicationError::Network("timeout".into()).is_retryable());
        assert!(ReplicationError::Protocol("bad frame".into()).is_retryable());
        assert!(!ReplicationError::Protocol("bad frame".into()).is_transient());
        assert!(ReplicationError::Storage("corrupt page".into()).is_fatal());
        assert!(ReplicationError::Configuration("empty identifier".into()).is_fatal());
        assert!(!ReplicationError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::Network("connection reset".into());
        assert_eq!(err.to_string(), "transient network error: connection reset");
        assert_eq!(ReplicationError::Cancelled.to_string(), "replication cancelled");
    }
}
