//! # Coordination Store Contract
//!
//! The narrow interface Steward requires of the coordination store: leases
//! exposed as sessions, election primitives and single-key reads, writes
//! and watches. Implementations must be safe for concurrent use; a single
//! client is shared by every candidate and watcher of a process.

use crate::{GetResponse, KeyValue, LeaseId, Revision, StoreResult, WatchResponse};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Stream of watch responses. Ends when the watch is dropped by the store.
pub type WatchStream = BoxStream<'static, StoreResult<WatchResponse>>;

/// Stream of leader changes of an election. Ends when the store connection
/// is lost.
pub type ObserveStream = BoxStream<'static, KeyValue>;

/// A lease kept alive in the background for as long as the session lives.
#[async_trait]
pub trait Session: Send + Sync {
    /// Lease backing this session.
    fn lease(&self) -> LeaseId;

    /// Flips to `true` once the lease has expired or was revoked.
    fn done(&self) -> watch::Receiver<bool>;

    /// Stops keep-alives and revokes the lease.
    async fn close(&self) -> StoreResult<()>;

    /// Stops keep-alives without revoking the lease.
    ///
    /// The lease expires after its TTL unless another session adopts it
    /// through [`CoordinationClient::new_session`].
    fn orphan(&self);
}

/// Campaign side of an election, bound to one session.
#[async_trait]
pub trait Election: Send + Sync {
    /// Waits until `value` is elected.
    ///
    /// Dropping the returned future does not withdraw the campaign key;
    /// call [`Election::resign`] for that.
    async fn campaign(&self, value: &str) -> StoreResult<()>;

    /// Takes over leadership held by `leader` on this session's lease.
    async fn resume(&self, leader: &KeyValue) -> StoreResult<()>;

    /// Gives up leadership, or withdraws a pending campaign.
    async fn resign(&self) -> StoreResult<()>;
}

/// Client of the coordination store.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Creates a session with the given TTL.
    ///
    /// When `lease` is given the session adopts that lease instead of
    /// granting a new one; [`StoreError::LeaseNotFound`](crate::StoreError::LeaseNotFound)
    /// is returned if it no longer exists.
    async fn new_session(
        &self,
        ttl: Duration,
        lease: Option<LeaseId>,
    ) -> StoreResult<Arc<dyn Session>>;

    /// Returns the campaign handle of the election under `prefix`.
    fn election(&self, session: Arc<dyn Session>, prefix: &str) -> Arc<dyn Election>;

    /// Returns the current leader of the election under `prefix`, or
    /// [`StoreError::NoLeader`](crate::StoreError::NoLeader).
    async fn leader(&self, prefix: &str) -> StoreResult<KeyValue>;

    /// Streams every leader change of the election under `prefix`, starting
    /// with the current leader if there is one.
    async fn observe(&self, prefix: &str) -> StoreResult<ObserveStream>;

    /// Reads `key`, or every key starting with `key` when `prefix` is set.
    async fn get(&self, key: &str, prefix: bool) -> StoreResult<GetResponse>;

    /// Writes `key` and returns the revision of the write.
    async fn put(&self, key: &str, value: &str) -> StoreResult<Revision>;

    /// Deletes `key` and returns the revision of the delete, if it existed.
    async fn delete(&self, key: &str) -> StoreResult<Option<Revision>>;

    /// Watches `key` starting at `start_revision` (inclusive).
    ///
    /// If `start_revision` has been compacted the stream yields
    /// [`StoreError::Compacted`](crate::StoreError::Compacted) and ends.
    async fn watch(&self, key: &str, start_revision: Revision) -> StoreResult<WatchStream>;
}
