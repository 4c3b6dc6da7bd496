//! End-to-end tests for poll-daemon.
//!
//! Runs real peer tasks on tokio. The in-memory tests use paused time, so
//! multi-second elections complete instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use poll_core::{CoordinationEngine, EngineConfig, InMemoryMedium, InMemoryStore, KeyValueStore, Namespace};
use poll_daemon::{DirMedium, DirStore, LocalPoll, PeerEvent, PeerHandle, TokioClock, spawn_peer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::sleep;

const BASE_MS: u64 = 1_700_000_000_000;

fn config() -> EngineConfig {
    EngineConfig::new(Namespace::new("e2e_").unwrap(), "local").with_poll_interval(Duration::from_millis(1000))
}

// ============================================================================
// Helpers
// ============================================================================

/// Peers sharing one in-memory store, medium and fake endpoint.
struct Cluster {
    store: InMemoryStore,
    medium: InMemoryMedium,
    poll: Arc<LocalPoll>,
    clock: Arc<TokioClock>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Cluster {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store: InMemoryStore::new(),
            medium: InMemoryMedium::new(),
            poll: Arc::new(LocalPoll::new(Duration::from_millis(50))),
            clock: Arc::new(TokioClock::new(BASE_MS)),
            events_tx,
            events_rx,
        }
    }

    fn spawn(&self, seed: u64) -> PeerHandle {
        let store = self.store.context();
        let engine =
            CoordinationEngine::new(config(), store.clone(), self.medium.context(), StdRng::seed_from_u64(seed))
                .unwrap();
        spawn_peer(
            engine,
            store,
            self.poll.clone(),
            self.clock.clone(),
            self.events_tx.clone(),
        )
        .unwrap()
    }

    /// Everything reported so far.
    fn events(&mut self) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count(&self) -> Option<String> {
        self.store.get("e2e__Tabs").unwrap()
    }

    fn lock(&self) -> Option<String> {
        self.store.get("e2e_in_work").unwrap()
    }
}

fn data_for(events: &[PeerEvent], handle: &PeerHandle) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PeerEvent::Data { peer, .. } if *peer == handle.peer_id()))
        .count()
}

fn became_active(events: &[PeerEvent], handle: &PeerHandle) -> bool {
    events
        .iter()
        .any(|e| matches!(e, PeerEvent::ActiveChanged { peer, active: true } if *peer == handle.peer_id()))
}

// ============================================================================
// Single peer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_peer_polls_on_interval() {
    let mut cluster = Cluster::new();
    let peer = cluster.spawn(1);

    sleep(Duration::from_millis(3500)).await;

    let served = cluster.poll.served();
    assert!((3..=4).contains(&served), "served {served}");
    let status = peer.status().await.unwrap();
    assert!(status.active);
    assert_eq!(status.peer_count, 1);

    let events = cluster.events();
    assert!(became_active(&events, &peer));
    assert_eq!(data_for(&events, &peer) as u64, served);

    peer.shutdown().await;
    assert_eq!(cluster.lock().as_deref(), Some("false"));
    assert_eq!(cluster.count().as_deref(), Some("0"));
}

#[tokio::test(start_paused = true)]
async fn test_offline_peer_skips_polls() {
    let cluster = Cluster::new();
    let peer = cluster.spawn(1);
    peer.set_network_available(Some(false));

    sleep(Duration::from_millis(3500)).await;
    // Only the immediate poll at startup went out
    assert_eq!(cluster.poll.served(), 1);
    assert!(peer.status().await.unwrap().active);

    peer.set_network_available(None);
    sleep(Duration::from_millis(2000)).await;
    assert!(cluster.poll.served() >= 2);

    peer.shutdown().await;
}

// ============================================================================
// Election
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_peer_follows() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn(1);
    sleep(Duration::from_millis(10)).await;
    let b = cluster.spawn(2);

    sleep(Duration::from_millis(2500)).await;

    let a_status = a.status().await.unwrap();
    let b_status = b.status().await.unwrap();
    assert!(a_status.active);
    assert!(!b_status.active);
    assert_eq!(b_status.peer_count, 2);

    let events = cluster.events();
    assert!(!became_active(&events, &b));
    // Every result reaches the follower too
    assert_eq!(data_for(&events, &a), data_for(&events, &b));
    assert!(data_for(&events, &b) >= 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_handover() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn(1);
    sleep(Duration::from_millis(10)).await;
    let b = cluster.spawn(2);
    sleep(Duration::from_millis(2500)).await;

    a.shutdown().await;
    assert_eq!(cluster.count().as_deref(), Some("1"));
    cluster.events();

    sleep(Duration::from_millis(3000)).await;

    assert!(b.status().await.unwrap().active);
    assert!(became_active(&cluster.events(), &b));
    assert_eq!(cluster.lock().as_deref(), Some("true"));

    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_leader_replaced_after_lease() {
    let cluster = Cluster::new();
    let a = cluster.spawn(1);
    sleep(Duration::from_millis(10)).await;
    let b = cluster.spawn(2);
    sleep(Duration::from_millis(2500)).await;

    // No teardown: the lock stays "true" with an aging heartbeat
    a.abort();
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(cluster.lock().as_deref(), Some("true"));
    assert!(!b.status().await.unwrap().active);

    sleep(Duration::from_millis(8000)).await;

    assert!(b.status().await.unwrap().active);
    assert_eq!(cluster.lock().as_deref(), Some("true"));

    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recount_rebuilds_peer_count() {
    let cluster = Cluster::new();
    let a = cluster.spawn(1);
    let b = cluster.spawn(2);
    let c = cluster.spawn(3);
    sleep(Duration::from_millis(100)).await;

    cluster.store.set("e2e__Tabs", "17").unwrap();
    a.recount();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(cluster.count().as_deref(), Some("3"));

    for peer in [a, b, c] {
        peer.shutdown().await;
    }
    assert_eq!(cluster.count().as_deref(), Some("0"));
}

// ============================================================================
// Shared directory
// ============================================================================

#[tokio::test]
async fn test_peers_coordinate_through_directory() {
    let tmp = TempDir::new().unwrap();
    let poll = Arc::new(LocalPoll::default());
    let clock = Arc::new(poll_core::SystemClock);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let config = config();
    let channel = config.namespace.channel_name();

    let mut handles = Vec::new();
    for seed in 0..2 {
        let store = DirStore::open(tmp.path().join("store")).unwrap();
        let medium = DirMedium::open(tmp.path(), &channel).unwrap();
        let engine = CoordinationEngine::new(config.clone(), store.clone(), medium, StdRng::seed_from_u64(seed)).unwrap();
        handles.push(spawn_peer(engine, store, poll.clone(), clock.clone(), events_tx.clone()).unwrap());
        sleep(Duration::from_millis(200)).await;
    }

    sleep(Duration::from_millis(3000)).await;

    let mut active = 0;
    for handle in &handles {
        if handle.status().await.unwrap().active {
            active += 1;
        }
    }
    assert_eq!(active, 1);

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    assert!(data_for(&events, &handles[0]) >= 2);
    assert!(data_for(&events, &handles[1]) >= 2);

    for handle in handles {
        handle.shutdown().await;
    }
    let store = DirStore::open(tmp.path().join("store")).unwrap();
    assert_eq!(store.get("e2e__Tabs").unwrap().as_deref(), Some("0"));
}
