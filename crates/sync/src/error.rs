//! Error types for remote synchronization.

use baton_resilience::RetryError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote store is unreachable.
    #[error("remote store is offline")]
    Offline,

    /// The remote store rejected or failed a request.
    #[error("remote request '{operation}' failed: {reason}")]
    Remote { operation: String, reason: String },

    #[error("remote request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    /// A realtime channel could not be opened.
    #[error("subscription to '{channel}' failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    /// Local state could not be read or written.
    #[error("local store error: {0}")]
    Local(String),
}

impl SyncError {
    pub fn remote(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn subscribe_failed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SubscribeFailed {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying later could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::Timeout { .. } | Self::CircuitOpen { .. } | Self::Remote { .. }
        )
    }
}

impl From<baton_core::Error> for SyncError {
    fn from(error: baton_core::Error) -> Self {
        Self::Local(error.to_string())
    }
}

impl From<RetryError<SyncError>> for SyncError {
    fn from(error: RetryError<SyncError>) -> Self {
        match error {
            RetryError::Timeout(timeout) => Self::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RetryError::CircuitOpen { name } => Self::CircuitOpen { name },
            RetryError::Operation(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_retry_error_conversion() {
        let timeout: SyncError = RetryError::<SyncError>::Timeout(Duration::from_millis(250)).into();
        assert_eq!(timeout, SyncError::Timeout { timeout_ms: 250 });

        let inner: SyncError = RetryError::Operation(SyncError::Offline).into();
        assert_eq!(inner, SyncError::Offline);
        assert!(inner.is_transient());
    }

    #[test]
    fn test_local_error_is_not_transient() {
        let err: SyncError = baton_core::Error::RaceNotInitialized.into();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("not been initialized"));
    }
}
