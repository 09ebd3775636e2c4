//! Error types for the scheduler crate.

use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug)]
pub enum SchedError {
    /// Guest program is malformed or failed validation
    #[error("compile error: {0}")]
    Compile(String),

    /// An import could not be resolved during instantiation
    #[error("link error: {0}")]
    Link(String),

    /// Guest code raised an unrecoverable fault
    #[error("trap: {0}")]
    Trap(String),

    /// Host-side misuse: polling a finished task, arity mismatch, poisoned context
    #[error("host error: {0}")]
    Host(String),

    /// Deadline reached under the trap-on-deadline policy
    #[error("epoch deadline {deadline} exceeded (clock at {epoch})")]
    DeadlineExceeded {
        /// Deadline the context was armed with
        deadline: u64,
        /// Clock value observed at the checkpoint
        epoch: u64,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    /// Shorthand for a [`SchedError::Host`] error.
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// True for errors raised by guest execution itself.
    ///
    /// These leave the instance in an undefined state; the context that ran
    /// the guest must not be reused.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap(_) | Self::DeadlineExceeded { .. })
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trap_classification() {
        assert!(SchedError::Trap("unreachable".into()).is_trap());
        assert!(SchedError::DeadlineExceeded { deadline: 3, epoch: 3 }.is_trap());
        assert!(!SchedError::host("polled twice").is_trap());
        assert!(!SchedError::Link("env::f".into()).is_trap());
    }

    #[test]
    fn test_deadline_message() {
        let err = SchedError::DeadlineExceeded { deadline: 4, epoch: 5 };
        assert_eq!(err.to_string(), "epoch deadline 4 exceeded (clock at 5)");
    }
}
