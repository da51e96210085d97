//! Single-key watcher.
//!
//! Follows one key across store reconnects and compactions. Events are
//! delivered in revision order and no revision is delivered twice.

use crate::{LeaderError, LeaderResult};
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{CoordinationClient, Event, EventKind, Revision, StoreResult};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default delay before a failed watch is reopened
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of a [`Watcher`]
#[derive(Clone)]
pub struct WatcherConfig {
    /// Key to follow
    pub key: String,

    /// Coordination store client
    pub client: Option<Arc<dyn CoordinationClient>>,

    /// Delay before a lost watch is reopened; zero selects
    /// [`DEFAULT_RETRY_TIMEOUT`]
    pub retry_timeout: Duration,
}

impl WatcherConfig {
    pub fn new(key: impl Into<String>, client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            key: key.into(),
            client: Some(client),
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }

    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    pub fn validate(mut self) -> LeaderResult<Self> {
        if self.key.is_empty() {
            return Err(LeaderError::config("watched key must not be empty"));
        }
        if self.client.is_none() {
            return Err(LeaderError::config("coordination client is required"));
        }
        if self.retry_timeout.is_zero() {
            self.retry_timeout = DEFAULT_RETRY_TIMEOUT;
        }
        Ok(self)
    }
}

impl fmt::Debug for WatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherConfig")
            .field("key", &self.key)
            .field("retry_timeout", &self.retry_timeout)
            .finish_non_exhaustive()
    }
}

/// Follows a single key and delivers its changes.
pub struct Watcher {
    key: String,
    events_rx: mpsc::Receiver<Event>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Starts watching. An existing value is delivered as the first event.
    pub fn new(config: WatcherConfig) -> LeaderResult<Self> {
        let config = config.validate()?;
        let client = config
            .client
            .clone()
            .ok_or_else(|| LeaderError::config("coordination client is required"))?;

        let (events_tx, events_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor = WatcherActor {
            key: config.key.clone(),
            client,
            retry_timeout: config.retry_timeout,
            events: events_tx,
            shutdown: shutdown_rx,
            revision: 0,
            delivered: 0,
            present: false,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            key: config.key,
            events_rx,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Changes of the key. Closed once the watcher stops.
    pub fn resp_chan(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events_rx
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stops the watcher. Events still buffered are discarded and none are
    /// delivered after this returns.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(key = %self.key, "watcher task failed: {}", e);
            }
        }
        self.events_rx.close();
        while self.events_rx.try_recv().is_ok() {}
    }
}

enum Flow {
    Ended,
    Stopped,
}

struct WatcherActor {
    key: String,
    client: Arc<dyn CoordinationClient>,
    retry_timeout: Duration,
    events: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
    /// Revision the next watch resumes after
    revision: Revision,
    /// Revision of the last delivered event
    delivered: Revision,
    /// Whether the last delivered event was a put
    present: bool,
}

impl WatcherActor {
    async fn run(mut self) {
        info!(key = %self.key, "Starting watcher");
        let mut synced = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if !synced {
                match self.resync().await {
                    Ok(true) => synced = true,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Failed to read watched key");
                        if !self.backoff().await {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.follow().await {
                Ok(Flow::Stopped) => break,
                Ok(Flow::Ended) => {
                    debug!(key = %self.key, revision = self.revision, "Watch ended");
                    if !self.backoff().await {
                        break;
                    }
                }
                Err(e) => match e.compact_revision() {
                    Some(compact_revision) => {
                        warn!(
                            key = %self.key,
                            revision = self.revision,
                            compact_revision,
                            "Watch revision compacted, resynchronizing"
                        );
                        self.revision = self.revision.max(compact_revision);
                        synced = false;
                    }
                    None => {
                        warn!(key = %self.key, error = %e, "Watch failed");
                        if !self.backoff().await {
                            break;
                        }
                    }
                },
            }
        }

        debug!(key = %self.key, "Watcher stopped");
    }

    /// Reads the key and delivers its current state if it is newer than
    /// anything delivered so far. Returns `false` on shutdown.
    async fn resync(&mut self) -> StoreResult<bool> {
        let resp = self.client.get(&self.key, false).await?;
        let event = match resp.first() {
            Some(kv) if kv.mod_revision > self.delivered => Some(Event::put(kv.clone())),
            None if self.present => Some(Event::delete(self.key.clone(), resp.revision)),
            _ => None,
        };

        if let Some(event) = event {
            if !self.deliver(event).await {
                return Ok(false);
            }
        }
        self.revision = self.revision.max(resp.revision);
        Ok(true)
    }

    async fn follow(&mut self) -> StoreResult<Flow> {
        let mut stream = self.client.watch(&self.key, self.revision + 1).await?;
        debug!(key = %self.key, revision = self.revision + 1, "Watch opened");

        loop {
            let resp = tokio::select! {
                _ = self.shutdown.changed() => return Ok(Flow::Stopped),
                resp = stream.next() => resp,
            };
            let Some(resp) = resp else {
                return Ok(Flow::Ended);
            };

            for event in resp?.events {
                if event.revision() <= self.revision {
                    continue;
                }
                if !self.deliver(event).await {
                    return Ok(Flow::Stopped);
                }
            }
        }
    }

    async fn deliver(&mut self, event: Event) -> bool {
        let revision = event.revision();
        let present = event.kind == EventKind::Put;
        debug!(key = %self.key, revision, kind = %event.kind, "Delivering event");

        tokio::select! {
            sent = self.events.send(event) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = self.shutdown.changed() => return false,
        }

        self.revision = self.revision.max(revision);
        self.delivered = revision;
        self.present = present;
        true
    }

    async fn backoff(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_timeout) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_testing::{InMemoryClient, InMemoryStore};
    use tokio::time::{sleep, timeout};

    const KEY: &str = "/cluster/nodes/10.0.0.1/election-enabled";
    const WAIT: Duration = Duration::from_secs(60);

    fn start(client: &InMemoryClient) -> Watcher {
        let client: Arc<dyn CoordinationClient> = Arc::new(client.clone());
        Watcher::new(WatcherConfig::new(KEY, client).with_retry_timeout(Duration::from_secs(1)))
            .unwrap()
    }

    async fn next_event(watcher: &mut Watcher) -> Event {
        timeout(WAIT, watcher.resp_chan().recv())
            .await
            .expect("timed out waiting for event")
            .expect("watcher channel closed")
    }

    #[test]
    fn test_config_validation() {
        let store = InMemoryStore::new();
        let client: Arc<dyn CoordinationClient> = Arc::new(store.client());

        assert!(WatcherConfig::new("", client.clone()).validate().is_err());
        let config = WatcherConfig::new(KEY, client)
            .with_retry_timeout(Duration::ZERO)
            .validate()
            .unwrap();
        assert_eq!(config.retry_timeout, DEFAULT_RETRY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_existing_value_then_changes() {
        let store = InMemoryStore::new();
        let client = store.client();
        let created = client.put(KEY, "true").await.unwrap();

        let mut watcher = start(&client);
        let first = next_event(&mut watcher).await;
        assert_eq!(first.kind, EventKind::Put);
        assert_eq!(first.kv.value, "true");
        assert_eq!(first.revision(), created);

        let updated = client.put(KEY, "false").await.unwrap();
        let second = next_event(&mut watcher).await;
        assert_eq!(second.kv.value, "false");
        assert_eq!(second.revision(), updated);

        let deleted = client.delete(KEY).await.unwrap().unwrap();
        let third = next_event(&mut watcher).await;
        assert_eq!(third.kind, EventKind::Delete);
        assert_eq!(third.revision(), deleted);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_keys() {
        let store = InMemoryStore::new();
        let client = store.client();
        let mut watcher = start(&client);

        client.put("/cluster/other", "x").await.unwrap();
        let revision = client.put(KEY, "true").await.unwrap();
        assert_eq!(next_event(&mut watcher).await.revision(), revision);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resyncs_after_compaction() {
        let store = InMemoryStore::new();
        let client = store.client();
        let writer = store.client();
        writer.put(KEY, "v1").await.unwrap();

        let mut watcher = start(&client);
        assert_eq!(next_event(&mut watcher).await.kv.value, "v1");

        client.disconnect();
        writer.put(KEY, "v2").await.unwrap();
        let latest = writer.put(KEY, "v3").await.unwrap();
        store.compact(store.revision());
        client.reconnect();

        let event = next_event(&mut watcher).await;
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.kv.value, "v3");
        assert_eq!(event.revision(), latest);

        let next = writer.put(KEY, "v4").await.unwrap();
        assert_eq!(next_event(&mut watcher).await.revision(), next);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesizes_delete_after_compaction() {
        let store = InMemoryStore::new();
        let client = store.client();
        let writer = store.client();
        writer.put(KEY, "v1").await.unwrap();

        let mut watcher = start(&client);
        assert_eq!(next_event(&mut watcher).await.kv.value, "v1");

        client.disconnect();
        writer.delete(KEY).await.unwrap();
        writer.put("/cluster/other", "x").await.unwrap();
        store.compact(store.revision());
        client.reconnect();

        let event = next_event(&mut watcher).await;
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.kv.key, KEY);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_buffered_event() {
        let store = InMemoryStore::new();
        let client = store.client();
        client.put(KEY, "true").await.unwrap();

        let mut watcher = start(&client);
        sleep(Duration::from_millis(100)).await;
        watcher.stop().await;
        assert!(watcher.resp_chan().recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_channel() {
        let store = InMemoryStore::new();
        let client = store.client();
        let mut watcher = start(&client);

        watcher.stop().await;
        watcher.stop().await;
        client.put(KEY, "true").await.unwrap();
        assert!(watcher.resp_chan().recv().await.is_none());
    }
}
