//! # Steward Core
//!
//! Shared building blocks for the Steward leader-election and reconciliation
//! crates:
//!
//! - **Store contract**: the [`CoordinationClient`], [`Session`] and
//!   [`Election`] traits every coordination-store backend implements
//! - **Types**: keys with revision metadata, change events, watch responses
//! - **Errors**: the store boundary error with its closed classification,
//!   and the step error used by reconciliation plans

pub mod error;
pub mod store;
pub mod types;

pub use error::*;
pub use store::{CoordinationClient, Election, ObserveStream, Session, WatchStream};
pub use types::*;
