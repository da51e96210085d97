//! Election integration tests
//!
//! Several candidates share one in-memory store; partitions are simulated by
//! disconnecting individual clients.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use steward_core::CoordinationClient;
use steward_leader::{Candidate, CandidateConfig, CandidateState};
use steward_testing::{InMemoryClient, InMemoryStore};

const PREFIX: &str = "/cluster/election";
const TERM: Duration = Duration::from_secs(5);
const RECONNECT: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn candidate(client: &InMemoryClient, name: &str) -> Candidate {
    let client: Arc<dyn CoordinationClient> = Arc::new(client.clone());
    Candidate::new(
        CandidateConfig::new(name, PREFIX, client)
            .with_term(TERM)
            .with_reconnect_timeout(RECONNECT),
    )
    .unwrap()
}

async fn next_leader(candidate: &mut Candidate) -> String {
    timeout(WAIT, candidate.leader_chan().recv())
        .await
        .expect("timed out waiting for leader")
        .expect("leader channel closed")
}

async fn wait_state(candidate: &Candidate, state: CandidateState) {
    let mut rx = candidate.handle().subscribe();
    timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for state")
        .expect("candidate dropped");
}

/// Exactly one of three candidates leads and everyone agrees on it
#[tokio::test(start_paused = true)]
async fn test_single_leader_among_three() {
    init_logging();
    let store = InMemoryStore::new();
    let mut candidates = vec![
        candidate(&store.client(), "10.0.0.1"),
        candidate(&store.client(), "10.0.0.2"),
        candidate(&store.client(), "10.0.0.3"),
    ];

    let mut observed = Vec::new();
    for candidate in candidates.iter_mut() {
        observed.push(next_leader(candidate).await);
    }
    assert!(observed.iter().all(|leader| *leader == observed[0]));

    let leader = store.leader(PREFIX).unwrap().value;
    assert_eq!(leader, observed[0]);
    sleep(Duration::from_millis(100)).await;

    let leading = candidates
        .iter()
        .filter(|candidate| candidate.state() == CandidateState::Leading)
        .count();
    assert_eq!(leading, 1);

    for candidate in candidates.iter_mut() {
        candidate.stop().await;
    }
    assert!(store.leases().is_empty());
}

/// A partitioned leader is replaced within one term plus one reconnect
/// interval, and follows the new leader once the partition heals
#[tokio::test(start_paused = true)]
async fn test_failover_on_partition() {
    init_logging();
    let store = InMemoryStore::new();
    let client_a = store.client();
    let mut a = candidate(&client_a, "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    let mut b = candidate(&store.client(), "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;

    let partitioned_at = Instant::now();
    client_a.disconnect();

    assert_eq!(next_leader(&mut a).await, "");
    assert_eq!(next_leader(&mut b).await, "10.0.0.2");
    assert!(partitioned_at.elapsed() <= TERM + RECONNECT);
    assert_eq!(a.state(), CandidateState::Disconnected);

    client_a.reconnect();
    assert_eq!(next_leader(&mut a).await, "10.0.0.2");
    wait_state(&a, CandidateState::Campaigning).await;
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.2");

    a.stop().await;
    b.stop().await;
}

/// A leader partitioned for less than a term resumes on its old lease
#[tokio::test(start_paused = true)]
async fn test_leader_resumes_after_short_partition() {
    init_logging();
    let store = InMemoryStore::new();
    let client_a = store.client();
    let mut a = candidate(&client_a, "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;
    let lease = store.leader(PREFIX).unwrap().lease;

    client_a.disconnect();
    assert_eq!(next_leader(&mut a).await, "");
    sleep(TERM / 3).await;
    client_a.reconnect();

    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;
    let leader = store.leader(PREFIX).unwrap();
    assert_eq!(leader.value, "10.0.0.1");
    assert_eq!(leader.lease, lease);
    assert_eq!(store.leases(), vec![lease]);

    a.stop().await;
}

/// A leader paused while partitioned gives up its old key on reconnect
/// instead of resuming leadership
#[tokio::test(start_paused = true)]
async fn test_paused_during_partition_does_not_resume() {
    init_logging();
    let store = InMemoryStore::new();
    let client_a = store.client();
    let mut a = candidate(&client_a, "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    let mut b = candidate(&store.client(), "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;

    client_a.disconnect();
    assert_eq!(next_leader(&mut a).await, "");
    a.pause(true).unwrap();
    sleep(Duration::from_millis(200)).await;
    client_a.reconnect();

    assert_eq!(next_leader(&mut a).await, "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.2");
    wait_state(&a, CandidateState::Paused).await;
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.2");

    sleep(TERM * 4).await;
    assert_eq!(a.state(), CandidateState::Paused);
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.2");

    a.stop().await;
    b.stop().await;
}

/// A step-down requested while partitioned takes effect on reconnect and
/// the cool-down still applies
#[tokio::test(start_paused = true)]
async fn test_step_down_during_partition_resigns_on_reconnect() {
    init_logging();
    let store = InMemoryStore::new();
    let client_a = store.client();
    let mut a = candidate(&client_a, "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    let mut b = candidate(&store.client(), "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;

    client_a.disconnect();
    assert_eq!(next_leader(&mut a).await, "");
    a.step_down().unwrap();
    sleep(Duration::from_millis(200)).await;
    client_a.reconnect();

    assert_eq!(next_leader(&mut a).await, "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.2");
    wait_state(&a, CandidateState::Following).await;
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.2");

    wait_state(&a, CandidateState::Campaigning).await;
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.2");

    a.stop().await;
    b.stop().await;
}

/// A step-down while partitioned from a follower role stays a no-op
#[tokio::test(start_paused = true)]
async fn test_step_down_during_partition_as_follower_is_noop() {
    init_logging();
    let store = InMemoryStore::new();
    let mut a = candidate(&store.client(), "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    let client_b = store.client();
    let mut b = candidate(&client_b, "10.0.0.2");
    assert_eq!(next_leader(&mut b).await, "10.0.0.1");
    wait_state(&b, CandidateState::Campaigning).await;

    client_b.disconnect();
    wait_state(&b, CandidateState::Disconnected).await;
    b.step_down().unwrap();
    sleep(Duration::from_millis(200)).await;
    client_b.reconnect();

    wait_state(&b, CandidateState::Campaigning).await;
    assert_eq!(store.leader(PREFIX).unwrap().value, "10.0.0.1");

    a.stop().await;
    b.stop().await;
}

/// A revoked session is replaced and leadership is regained
#[tokio::test(start_paused = true)]
async fn test_recovers_from_revoked_session() {
    init_logging();
    let store = InMemoryStore::new();
    let mut a = candidate(&store.client(), "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;
    let lease = store.leader(PREFIX).unwrap().lease;

    assert!(store.revoke_lease(lease));
    assert_eq!(next_leader(&mut a).await, "");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");
    wait_state(&a, CandidateState::Leading).await;
    assert_ne!(store.leader(PREFIX).unwrap().lease, lease);

    a.stop().await;
}

/// A candidate started paused observes the election without joining it
#[tokio::test(start_paused = true)]
async fn test_paused_candidate_only_observes() {
    init_logging();
    let store = InMemoryStore::new();
    let mut a = candidate(&store.client(), "10.0.0.1");
    assert_eq!(next_leader(&mut a).await, "10.0.0.1");

    let client: Arc<dyn CoordinationClient> = Arc::new(store.client());
    let mut b = Candidate::new(
        CandidateConfig::new("10.0.0.2", PREFIX, client)
            .with_term(TERM)
            .with_paused(true),
    )
    .unwrap();
    assert_eq!(next_leader(&mut b).await, "10.0.0.1");
    wait_state(&b, CandidateState::Paused).await;

    a.stop().await;
    sleep(TERM * 2).await;
    assert!(store.leader(PREFIX).is_none());
    assert_eq!(b.state(), CandidateState::Paused);

    b.pause(false).unwrap();
    assert_eq!(next_leader(&mut b).await, "10.0.0.2");
    b.stop().await;
}
