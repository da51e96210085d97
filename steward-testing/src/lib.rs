//! Testing utilities for Steward.
//!
//! [`InMemoryStore`] is a complete in-process coordination store: leases,
//! elections, revisioned keys, compaction and watches. Clients can be
//! partitioned from it and healed again to exercise failover paths.

pub mod store;

pub use store::{InMemoryClient, InMemoryStore};
