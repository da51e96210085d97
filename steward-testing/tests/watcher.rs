//! Watcher integration tests
//!
//! Verify that a watcher follows a key across forced reconnects and
//! compactions without gaps or duplicate revisions.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use steward_core::{CoordinationClient, Event, EventKind, Revision};
use steward_leader::{Watcher, WatcherConfig};
use steward_testing::{InMemoryClient, InMemoryStore};

const KEY: &str = "/cluster/nodes/10.0.0.1/election-enabled";
const WAIT: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn watcher(client: &InMemoryClient) -> Watcher {
    let client: Arc<dyn CoordinationClient> = Arc::new(client.clone());
    Watcher::new(WatcherConfig::new(KEY, client).with_retry_timeout(Duration::from_secs(1)))
        .unwrap()
}

/// Collects events until one at `revision` or later has been delivered.
async fn collect_until(watcher: &mut Watcher, revision: Revision) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = timeout(WAIT, watcher.resp_chan().recv())
            .await
            .expect("timed out waiting for event")
            .expect("watcher channel closed");
        let done = event.revision() >= revision;
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Every write is delivered exactly once, in order, across reconnects
#[tokio::test(start_paused = true)]
async fn test_no_gap_across_reconnects() {
    init_logging();
    let store = InMemoryStore::new();
    let client = store.client();
    let writer = store.client();
    let mut watcher = watcher(&client);

    let mut written = Vec::new();
    for i in 0..20 {
        if i % 5 == 2 {
            client.disconnect();
        }
        written.push(writer.put(KEY, &format!("v{}", i)).await.unwrap());
        if i % 5 == 4 {
            client.reconnect();
        }
        sleep(Duration::from_millis(300)).await;
    }
    client.reconnect();

    let last = *written.last().unwrap();
    let events = collect_until(&mut watcher, last).await;
    let delivered: Vec<Revision> = events.iter().map(Event::revision).collect();
    assert_eq!(delivered, written);
    assert!(events.iter().all(|event| event.kind == EventKind::Put));
    assert_eq!(events.last().unwrap().kv.value, "v19");

    watcher.stop().await;
}

/// Revisions stay strictly increasing when history is compacted while the
/// watcher is disconnected, and the latest value always arrives
#[tokio::test(start_paused = true)]
async fn test_monotonic_across_compaction() {
    init_logging();
    let store = InMemoryStore::new();
    let client = store.client();
    let writer = store.client();
    let mut watcher = watcher(&client);

    let mut last = 0;
    for round in 0..4 {
        client.disconnect();
        for i in 0..3 {
            last = writer
                .put(KEY, &format!("r{}-{}", round, i))
                .await
                .unwrap();
        }
        store.compact(store.revision());
        client.reconnect();
        sleep(Duration::from_secs(2)).await;
    }

    let events = collect_until(&mut watcher, last).await;
    assert!(events
        .windows(2)
        .all(|pair| pair[0].revision() < pair[1].revision()));
    assert_eq!(events.last().unwrap().kv.value, "r3-2");

    watcher.stop().await;
}

/// A key deleted and recreated during a partition is reported by its
/// latest state only
#[tokio::test(start_paused = true)]
async fn test_delete_during_partition_without_compaction() {
    init_logging();
    let store = InMemoryStore::new();
    let client = store.client();
    let writer = store.client();
    writer.put(KEY, "true").await.unwrap();

    let mut watcher = watcher(&client);
    assert_eq!(
        collect_until(&mut watcher, 1).await.last().unwrap().kv.value,
        "true"
    );

    client.disconnect();
    let deleted = writer.delete(KEY).await.unwrap().unwrap();
    let recreated = writer.put(KEY, "false").await.unwrap();
    client.reconnect();

    let events = collect_until(&mut watcher, recreated).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Delete);
    assert_eq!(events[0].revision(), deleted);
    assert_eq!(events[1].kv.value, "false");

    watcher.stop().await;
}
