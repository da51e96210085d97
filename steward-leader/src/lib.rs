//! # Steward Leader
//!
//! Leader election on top of a coordination store.
//!
//! This crate provides:
//! - [`Candidate`]: campaigns for an election prefix, reports leadership
//!   changes and survives session expiry and store partitions
//! - [`Watcher`]: follows a single key across reconnects and compactions
//!   without gaps or duplicate revisions

pub mod candidate;
pub mod errors;
pub mod watcher;

pub use candidate::{
    Candidate, CandidateConfig, CandidateHandle, CandidateState, DEFAULT_RECONNECT_TIMEOUT,
    DEFAULT_TERM, MIN_TERM,
};
pub use errors::{LeaderError, LeaderResult};
pub use watcher::{Watcher, WatcherConfig, DEFAULT_RETRY_TIMEOUT};
