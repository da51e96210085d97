//! # Error Types
//!
//! Two layers of errors are defined here:
//!
//! - [`StoreError`] is returned by every [`CoordinationClient`](crate::store::CoordinationClient)
//!   call. It is classified exactly once, at the boundary, into the closed
//!   [`ErrorKind`] enum so that the rest of the system never inspects
//!   concrete store errors again.
//! - [`StewardError`] is the error of a reconciliation step: unit manager
//!   failures, filesystem failures and store failures surfaced by a step.

use crate::{LeaseId, Revision};
use thiserror::Error;

/// Result type for coordination-store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by the coordination store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached (partition, connection refused)
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// The election has no leader
    #[error("Election has no leader")]
    NoLeader,

    /// The session's lease has expired or was revoked
    #[error("Session expired")]
    SessionExpired,

    /// The referenced lease does not exist (expired or never granted)
    #[error("Lease {lease} not found")]
    LeaseNotFound { lease: LeaseId },

    /// The referenced key does not exist
    #[error("Key {key} not found")]
    KeyNotFound { key: String },

    /// The requested revision has been discarded by compaction
    #[error("Required revision has been compacted, compact revision is {compact_revision}")]
    Compacted { compact_revision: Revision },

    /// The session already holds leadership of the election
    #[error("Already leader of election {prefix}")]
    AlreadyLeader { prefix: String },

    /// The operation was canceled by its caller
    #[error("Operation canceled")]
    Canceled,

    /// Any other error reported by the store
    #[error("Store error: {message}")]
    Internal { message: String },
}

/// Closed classification of [`StoreError`]s.
///
/// # Examples
///
/// ```rust
/// use steward_core::{ErrorKind, StoreError};
///
/// assert_eq!(StoreError::NoLeader.kind(), ErrorKind::NotFound);
/// assert_eq!(StoreError::unavailable("partition").kind(), ErrorKind::Transient);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retry after a delay: network partitions, expired sessions, compaction
    Transient,
    /// The leader, lease or key is missing
    NotFound,
    /// The caller already holds leadership
    AlreadyLeader,
    /// Not expected to succeed on retry
    Fatal,
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies the error.
    ///
    /// Cancellation is classified as transient, but callers are expected to
    /// check [`StoreError::is_canceled`] first: a canceled call is not a
    /// failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. }
            | Self::SessionExpired
            | Self::Compacted { .. }
            | Self::Canceled => ErrorKind::Transient,
            Self::NoLeader | Self::LeaseNotFound { .. } | Self::KeyNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::AlreadyLeader { .. } => ErrorKind::AlreadyLeader,
            Self::Internal { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns the compaction revision if this is a compaction error.
    pub fn compact_revision(&self) -> Option<Revision> {
        match self {
            Self::Compacted { compact_revision } => Some(*compact_revision),
            _ => None,
        }
    }
}

/// Result type for reconciliation steps and plans.
pub type Result<T> = std::result::Result<T, StewardError>;

/// Errors raised while converging local node state.
#[derive(Error, Debug)]
pub enum StewardError {
    /// The service manager does not know the unit
    #[error("Unit {unit} not found")]
    UnitNotFound { unit: String },

    /// The service manager failed to act on the unit
    #[error("Unit {unit} error: {message}")]
    Unit { unit: String, message: String },

    /// Coordination-store failure surfaced by a step
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Filesystem or process I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StewardError {
    pub fn unit_not_found(unit: impl Into<String>) -> Self {
        Self::UnitNotFound { unit: unit.into() }
    }

    pub fn unit(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unit {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_unit_not_found(&self) -> bool {
        matches!(self, Self::UnitNotFound { .. })
    }

    /// Determines whether the failure may clear up on a later attempt.
    ///
    /// A missing unit is retryable: it may be installed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnitNotFound { .. } | Self::Unit { .. } | Self::Io(_) => true,
            Self::Store(e) => e.kind() == ErrorKind::Transient,
            Self::Config { .. } | Self::Internal { .. } => false,
        }
    }
}
