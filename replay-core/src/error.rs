//! Error type shared by tables, the chunk store and checkpointers.

use thiserror::Error;

/// Errors surfaced through the table, chunk store and checkpointer contracts.
///
/// Variants map one-to-one onto RPC status codes at the service edge, so
/// implementations should pick the variant describing the failure class and
/// keep the message free of code prefixes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    /// Requested entity (checkpoint, chunk, item) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Caller supplied an argument the callee cannot accept.
    #[error("{0}")]
    InvalidArgument(String),

    /// Operation is not valid in the current state of the callee.
    #[error("{0}")]
    FailedPrecondition(String),

    /// A blocking operation ran out of time, e.g. the rate limiter wait.
    #[error("{0}")]
    DeadlineExceeded(String),

    /// The callee has been closed.
    #[error("{0}")]
    Cancelled(String),

    /// Bug or broken invariant inside the callee.
    #[error("{0}")]
    Internal(String),
}

impl ReplayError {
    /// Whether the error means "nothing there", which checkpoint restore
    /// treats as a reason to fall back rather than to fail.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for contract operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint_is_not_found() {
        let err = ReplayError::NotFound("No checkpoint found in /tmp/ckpt.".to_string());
        assert_eq!(err.to_string(), "No checkpoint found in /tmp/ckpt.");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_messages_are_passed_through() {
        let err = ReplayError::DeadlineExceeded("Rate limiter timeout exceeded".to_string());
        assert_eq!(err.to_string(), "Rate limiter timeout exceeded");
        assert!(!err.is_not_found());
    }
}
