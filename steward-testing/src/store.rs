//! In-memory coordination store.
//!
//! Implements the full [`CoordinationClient`] contract in process: leases
//! with TTL-driven expiry, elections ordered by create revision, revisioned
//! history with compaction, and key watches. Every [`InMemoryClient`] can be
//! partitioned from the store independently to simulate network failures.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steward_core::{
    CoordinationClient, Election, Event, GetResponse, KeyValue, LeaseId, ObserveStream, Revision,
    Session, StoreError, StoreResult, WatchResponse, WatchStream, NO_LEASE,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Keep-alives are sent this many times per TTL.
const KEEPALIVES_PER_TTL: u32 = 3;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
    done: watch::Sender<bool>,
}

struct KeyWatcher {
    client: u64,
    key: String,
    tx: mpsc::UnboundedSender<StoreResult<WatchResponse>>,
}

#[derive(Default)]
struct StoreState {
    revision: Revision,
    compact_revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    history: Vec<Event>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<KeyWatcher>,
}

impl StoreState {
    fn put(&mut self, key: &str, value: &str, lease: LeaseId) -> Revision {
        self.revision += 1;
        let revision = self.revision;

        let kv = match self.kvs.get(key) {
            Some(existing) => {
                if existing.lease != lease {
                    if let Some(previous) = self.leases.get_mut(&existing.lease) {
                        previous.keys.remove(key);
                    }
                }
                KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    create_revision: existing.create_revision,
                    mod_revision: revision,
                    version: existing.version + 1,
                    lease,
                }
            }
            None => KeyValue::new(key, value, revision).with_lease(lease),
        };

        if let Some(attached) = self.leases.get_mut(&lease) {
            attached.keys.insert(key.to_string());
        }
        self.kvs.insert(key.to_string(), kv.clone());
        self.publish(Event::put(kv));
        revision
    }

    fn delete(&mut self, key: &str) -> Option<Revision> {
        let kv = self.kvs.remove(key)?;
        if let Some(attached) = self.leases.get_mut(&kv.lease) {
            attached.keys.remove(key);
        }
        self.revision += 1;
        let revision = self.revision;
        self.publish(Event::delete(key, revision));
        Some(revision)
    }

    fn publish(&mut self, event: Event) {
        let revision = event.revision();
        self.watchers.retain(|watcher| {
            if watcher.key != event.kv.key {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchResponse {
                    events: vec![event.clone()],
                    revision,
                }))
                .is_ok()
        });
        self.history.push(event);
    }

    fn revoke(&mut self, lease: LeaseId) -> bool {
        let Some(revoked) = self.leases.remove(&lease) else {
            return false;
        };
        for key in &revoked.keys {
            self.delete(key);
        }
        revoked.done.send_replace(true);
        true
    }

    /// The leader of an election is its oldest live campaign key.
    fn leader(&self, prefix: &str) -> Option<KeyValue> {
        let scope = format!("{}/", prefix);
        self.kvs
            .range(scope.clone()..)
            .take_while(|(key, _)| key.starts_with(&scope))
            .map(|(_, kv)| kv)
            .min_by_key(|kv| kv.create_revision)
            .cloned()
    }
}

struct Shared {
    state: Mutex<StoreState>,
    changes: watch::Sender<Revision>,
    next_client: AtomicU64,
}

/// Process-local coordination store shared by any number of clients.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                changes,
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a new, connected client of this store.
    pub fn client(&self) -> InMemoryClient {
        let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed);
        let (connected, _) = watch::channel(true);
        InMemoryClient {
            store: self.clone(),
            id,
            connected: Arc::new(connected),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.shared.state.lock().revision
    }

    /// Discards history older than `revision`.
    ///
    /// Watches requested from a revision below the compaction point fail
    /// with [`StoreError::Compacted`].
    pub fn compact(&self, revision: Revision) {
        let mut state = self.shared.state.lock();
        let compact_revision = revision.min(state.revision);
        state.compact_revision = compact_revision;
        state
            .history
            .retain(|event| event.revision() >= compact_revision);
        debug!(compact_revision, "store compacted");
    }

    /// Revokes `lease` as if its TTL had elapsed.
    pub fn revoke_lease(&self, lease: LeaseId) -> bool {
        self.mutate(|state| state.revoke(lease))
    }

    /// Live leases, in ascending order.
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut leases: Vec<LeaseId> = self.shared.state.lock().leases.keys().copied().collect();
        leases.sort_unstable();
        leases
    }

    /// Current value of `key`, bypassing any client partition.
    pub fn value(&self, key: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .kvs
            .get(key)
            .map(|kv| kv.value.clone())
    }

    /// Current leader of the election under `prefix`, bypassing any client
    /// partition.
    pub fn leader(&self, prefix: &str) -> Option<KeyValue> {
        self.shared.state.lock().leader(prefix)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let (result, revision) = {
            let mut state = self.shared.state.lock();
            let result = f(&mut state);
            (result, state.revision)
        };
        self.shared.changes.send_replace(revision);
        result
    }

    fn grant(&self, ttl: Duration) -> (LeaseId, watch::Receiver<bool>) {
        let (done, done_rx) = watch::channel(false);
        let lease = self.mutate(|state| {
            state.next_lease += 1;
            let lease = state.next_lease;
            state.leases.insert(
                lease,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                    done,
                },
            );
            lease
        });
        self.spawn_expiry(lease);
        debug!(lease, ttl_ms = ttl.as_millis() as u64, "lease granted");
        (lease, done_rx)
    }

    fn spawn_expiry(&self, lease: LeaseId) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = store.shared.state.lock();
                    match state.leases.get(&lease) {
                        Some(entry) => entry.deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let expired = store.mutate(|state| match state.leases.get(&lease) {
                    Some(entry) if entry.deadline <= Instant::now() => state.revoke(lease),
                    _ => false,
                });
                if expired {
                    debug!(lease, "lease expired");
                    return;
                }
            }
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// A client connection to an [`InMemoryStore`].
#[derive(Clone)]
pub struct InMemoryClient {
    store: InMemoryStore,
    id: u64,
    connected: Arc<watch::Sender<bool>>,
}

impl InMemoryClient {
    /// Partitions this client from the store.
    ///
    /// Every call fails with [`StoreError::Unavailable`], open watch and
    /// observe streams end, and keep-alives of this client's sessions stop
    /// so their leases expire after one TTL.
    pub fn disconnect(&self) {
        self.connected.send_replace(false);
        let id = self.id;
        self.store
            .mutate(|state| state.watchers.retain(|watcher| watcher.client != id));
        debug!(client = id, "client disconnected");
    }

    /// Heals a partition created by [`InMemoryClient::disconnect`].
    pub fn reconnect(&self) {
        self.connected.send_replace(true);
        debug!(client = self.id, "client reconnected");
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// The store this client talks to.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    fn check(&self) -> StoreResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::unavailable(format!(
                "client {} is partitioned from the store",
                self.id
            )))
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    async fn new_session(
        &self,
        ttl: Duration,
        lease: Option<LeaseId>,
    ) -> StoreResult<Arc<dyn Session>> {
        self.check()?;
        let (lease, done) = match lease {
            Some(lease) => self.store.mutate(|state| match state.leases.get_mut(&lease) {
                Some(entry) => {
                    entry.deadline = Instant::now() + entry.ttl;
                    Ok((lease, entry.done.subscribe()))
                }
                None => Err(StoreError::LeaseNotFound { lease }),
            })?,
            None => self.store.grant(ttl),
        };
        Ok(InMemorySession::start(self.clone(), lease, ttl, done))
    }

    fn election(&self, session: Arc<dyn Session>, prefix: &str) -> Arc<dyn Election> {
        Arc::new(InMemoryElection {
            client: self.clone(),
            session,
            prefix: prefix.to_string(),
            key: Mutex::new(None),
        })
    }

    async fn leader(&self, prefix: &str) -> StoreResult<KeyValue> {
        self.check()?;
        self.store
            .shared
            .state
            .lock()
            .leader(prefix)
            .ok_or(StoreError::NoLeader)
    }

    async fn observe(&self, prefix: &str) -> StoreResult<ObserveStream> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.store.clone();
        let prefix = prefix.to_string();
        let mut connected = self.connected.subscribe();

        tokio::spawn(async move {
            let mut changes = store.shared.changes.subscribe();
            let mut last: Option<(String, String)> = None;
            loop {
                changes.borrow_and_update();
                if !*connected.borrow_and_update() {
                    return;
                }

                let leader = store.shared.state.lock().leader(&prefix);
                if let Some(kv) = leader {
                    let current = (kv.key.clone(), kv.value.clone());
                    if last.as_ref() != Some(&current) {
                        last = Some(current);
                        if tx.send(kv).is_err() {
                            return;
                        }
                    }
                }

                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn get(&self, key: &str, prefix: bool) -> StoreResult<GetResponse> {
        self.check()?;
        let state = self.store.shared.state.lock();
        let kvs = if prefix {
            state
                .kvs
                .range(key.to_string()..)
                .take_while(|(candidate, _)| candidate.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            state.kvs.get(key).cloned().into_iter().collect()
        };
        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<Revision> {
        self.check()?;
        Ok(self.store.mutate(|state| state.put(key, value, NO_LEASE)))
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<Revision>> {
        self.check()?;
        Ok(self.store.mutate(|state| state.delete(key)))
    }

    async fn watch(&self, key: &str, start_revision: Revision) -> StoreResult<WatchStream> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.store.shared.state.lock();

        if start_revision > 0 && start_revision < state.compact_revision {
            let _ = tx.send(Err(StoreError::Compacted {
                compact_revision: state.compact_revision,
            }));
            return Ok(receiver_stream(rx));
        }

        let revision = state.revision;
        let from = if start_revision <= 0 {
            revision + 1
        } else {
            start_revision
        };
        for event in state
            .history
            .iter()
            .filter(|event| event.kv.key == key && event.revision() >= from)
        {
            let _ = tx.send(Ok(WatchResponse {
                events: vec![event.clone()],
                revision,
            }));
        }
        state.watchers.push(KeyWatcher {
            client: self.id,
            key: key.to_string(),
            tx,
        });

        Ok(receiver_stream(rx))
    }
}

struct InMemorySession {
    client: InMemoryClient,
    lease: LeaseId,
    done: watch::Receiver<bool>,
    active: Arc<AtomicBool>,
}

impl InMemorySession {
    fn start(
        client: InMemoryClient,
        lease: LeaseId,
        ttl: Duration,
        done: watch::Receiver<bool>,
    ) -> Arc<dyn Session> {
        let active = Arc::new(AtomicBool::new(true));
        let keepalive_client = client.clone();
        let keepalive_active = active.clone();
        let period = (ttl / KEEPALIVES_PER_TTL).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !keepalive_active.load(Ordering::Acquire) {
                    return;
                }
                let mut state = keepalive_client.store.shared.state.lock();
                match state.leases.get_mut(&lease) {
                    Some(entry) => {
                        if keepalive_client.is_connected() {
                            entry.deadline = Instant::now() + entry.ttl;
                        }
                    }
                    None => return,
                }
            }
        });

        Arc::new(Self {
            client,
            lease,
            done,
            active,
        })
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn lease(&self) -> LeaseId {
        self.lease
    }

    fn done(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    async fn close(&self) -> StoreResult<()> {
        self.active.store(false, Ordering::Release);
        self.client.check()?;
        let lease = self.lease;
        self.client.store.mutate(|state| state.revoke(lease));
        Ok(())
    }

    fn orphan(&self) {
        self.active.store(false, Ordering::Release);
    }
}

struct InMemoryElection {
    client: InMemoryClient,
    session: Arc<dyn Session>,
    prefix: String,
    key: Mutex<Option<String>>,
}

#[async_trait]
impl Election for InMemoryElection {
    async fn campaign(&self, value: &str) -> StoreResult<()> {
        self.client.check()?;
        let lease = self.session.lease();
        let key = format!("{}/{:x}", self.prefix, lease);

        self.client.store.mutate(|state| {
            if !state.leases.contains_key(&lease) {
                return Err(StoreError::SessionExpired);
            }
            let current = state.kvs.get(&key).map(|kv| kv.value.as_str());
            if current != Some(value) {
                state.put(&key, value, lease);
            }
            Ok(())
        })?;
        *self.key.lock() = Some(key.clone());

        let mut changes = self.client.store.shared.changes.subscribe();
        let mut connected = self.client.connected.subscribe();
        loop {
            changes.borrow_and_update();
            {
                let state = self.client.store.shared.state.lock();
                if !state.leases.contains_key(&lease) {
                    return Err(StoreError::SessionExpired);
                }
                if !state.kvs.contains_key(&key) {
                    return Err(StoreError::Canceled);
                }
                if state.leader(&self.prefix).map(|kv| kv.key) == Some(key.clone()) {
                    return Ok(());
                }
            }
            self.client.check()?;

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(StoreError::internal("store dropped"));
                    }
                }
                _ = connected.changed() => {}
            }
        }
    }

    async fn resume(&self, leader: &KeyValue) -> StoreResult<()> {
        self.client.check()?;
        if leader.lease != self.session.lease() {
            return Err(StoreError::LeaseNotFound {
                lease: leader.lease,
            });
        }
        let held = self
            .client
            .store
            .shared
            .state
            .lock()
            .kvs
            .get(&leader.key)
            .map(|kv| kv.lease == leader.lease)
            .unwrap_or(false);
        if !held {
            return Err(StoreError::KeyNotFound {
                key: leader.key.clone(),
            });
        }
        *self.key.lock() = Some(leader.key.clone());
        Ok(())
    }

    async fn resign(&self) -> StoreResult<()> {
        self.client.check()?;
        let Some(key) = self.key.lock().take() else {
            return Ok(());
        };
        let lease = self.session.lease();
        self.client.store.mutate(|state| {
            let owned = state
                .kvs
                .get(&key)
                .map(|kv| kv.lease == lease)
                .unwrap_or(false);
            if owned {
                state.delete(&key);
            }
        });
        Ok(())
    }
}
