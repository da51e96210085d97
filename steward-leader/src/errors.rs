//! Error types for the candidate and watcher.

use steward_core::{StewardError, StoreError};
use thiserror::Error;

/// Result type for leader operations
pub type LeaderResult<T> = Result<T, LeaderError>;

/// Errors that can occur while constructing or driving a candidate or watcher
#[derive(Error, Debug)]
pub enum LeaderError {
    /// Configuration error
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// Coordination store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The background task has already exited
    #[error("Candidate {name} is stopped")]
    Stopped { name: String },
}

impl LeaderError {
    pub fn config(reason: impl Into<String>) -> Self {
        LeaderError::ConfigError {
            reason: reason.into(),
        }
    }
}

impl From<LeaderError> for StewardError {
    fn from(err: LeaderError) -> Self {
        match err {
            LeaderError::ConfigError { reason } => StewardError::Config { reason },
            LeaderError::Store(e) => StewardError::Store(e),
            LeaderError::Stopped { name } => {
                StewardError::internal(format!("Candidate {} is stopped", name))
            }
        }
    }
}
