//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A subscriber failed to handle an event.
    #[error("handler '{handler}' failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a handler failed error.
    pub fn handler_failed(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::handler_failed("sync", "remote down");
        assert!(err.to_string().contains("sync"));
        assert!(err.to_string().contains("remote down"));
    }
}
