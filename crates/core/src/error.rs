//! Core error types for Baton operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{LegId, RunnerId, Timestamp};

/// Core error type for Baton operations.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("failed to write file '{path}': {reason}")]
    FileWriteFailed { path: PathBuf, reason: String },

    #[error("failed to create directory '{path}': {reason}")]
    DirectoryCreationFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Race input errors
    #[error("no valid runners supplied ({rejected} rejected)")]
    NoValidRunners { rejected: usize },

    #[error("invalid race start time {value}: must be positive")]
    InvalidStartTime { value: Timestamp },

    #[error("race legs have not been initialized")]
    RaceNotInitialized,

    #[error("runner {id} not found")]
    RunnerNotFound { id: RunnerId },

    #[error("leg {id} not found")]
    LegNotFound { id: LegId },

    #[error("invalid time for leg {leg_id}: {reason}")]
    InvalidLegTime { leg_id: LegId, reason: String },

    #[error("setup is locked: remote data already exists for team '{team_id}'")]
    SetupLocked { team_id: String },

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a file write error.
    pub fn file_write_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a directory creation error.
    pub fn directory_creation_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DirectoryCreationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid leg time error.
    pub fn invalid_leg_time(leg_id: LegId, reason: impl Into<String>) -> Self {
        Self::InvalidLegTime {
            leg_id,
            reason: reason.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}
