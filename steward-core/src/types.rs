//! # Core Types
//!
//! Values exchanged with the coordination store: keys with their revision
//! metadata, change events and watch responses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-wide revision counter.
///
/// Every committed change is assigned the next revision. Revisions are used
/// to resume a watch after a reconnect without skipping or replaying changes.
pub type Revision = i64;

/// Identifier of a lease granted by the store.
///
/// The value `0` means "no lease": keys written without a lease never expire.
pub type LeaseId = i64;

/// Lease value used for keys that are not attached to a lease.
pub const NO_LEASE: LeaseId = 0;

/// A key with its value and revision metadata.
///
/// # Examples
///
/// ```rust
/// use steward_core::KeyValue;
///
/// let kv = KeyValue::new("/leader", "10.0.0.1", 4);
/// assert_eq!(kv.create_revision, 4);
/// assert_eq!(kv.mod_revision, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision of the put that created the key
    pub create_revision: Revision,
    /// Revision of the last change to the key
    pub mod_revision: Revision,
    /// Number of puts since the key was created
    pub version: i64,
    /// Lease the key is attached to, or [`NO_LEASE`]
    pub lease: LeaseId,
}

impl KeyValue {
    /// Creates a key written once at `revision`, without a lease.
    pub fn new(key: impl Into<String>, value: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            create_revision: revision,
            mod_revision: revision,
            version: 1,
            lease: NO_LEASE,
        }
    }

    /// Attaches the key to `lease`.
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }
}

/// Kind of change carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single change to a key.
///
/// For deletions `kv.value` is empty and `kv.mod_revision` is the revision
/// of the delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub kv: KeyValue,
}

impl Event {
    pub fn put(kv: KeyValue) -> Self {
        Self {
            kind: EventKind::Put,
            kv,
        }
    }

    /// Creates a deletion event for `key` committed at `revision`.
    pub fn delete(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            kind: EventKind::Delete,
            kv: KeyValue::new(key, "", revision),
        }
    }

    /// Revision at which this change was committed.
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

/// Result of a range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at the time of the read
    pub revision: Revision,
}

impl GetResponse {
    /// Returns the first key of the response, if any.
    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

/// A batch of events delivered on a watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub events: Vec<Event>,
    /// Store revision at the time the batch was sent
    pub revision: Revision,
}
