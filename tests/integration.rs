//! Integration tests for the assembled relay.
//!
//! Everything runs in-process: memory tiers, SQLite files under a tempdir,
//! and a recording transport standing in for the collector.
//!
//! Run with: `cargo test --test integration`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use telemetry_relay::storage::local::LocalTier;
use telemetry_relay::{
    AddOptions, ChannelHub, Event, RelayConfig, RelayPipeline, SignalSources, Signals,
    StorageManager, TierFactory, TierKind, Transport, TransportError,
};

// =============================================================================
// Test Transport
// =============================================================================

#[derive(Default)]
struct RecordingTransport {
    batches: Mutex<Vec<Vec<Event>>>,
    beacons: Mutex<Vec<Vec<Event>>>,
    down: AtomicBool,
    beacon_available: AtomicBool,
}

impl RecordingTransport {
    fn sent_names(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .iter()
            .map(|b| b.iter().map(|e| e.name.clone()).collect())
            .collect()
    }

    fn sent_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, events: &[Event]) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("collector down".into()));
        }
        self.batches.lock().push(events.to_vec());
        Ok(())
    }

    async fn beacon(&self, events: &[Event]) -> bool {
        if !self.beacon_available.load(Ordering::SeqCst) {
            return false;
        }
        self.beacons.lock().push(events.to_vec());
        true
    }
}

fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("relay.db").display())
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Pipeline
// =============================================================================

#[tokio::test]
async fn test_priority_events_skip_the_batch() {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport.clone(), Signals::fixed())
        .await
        .unwrap();

    for url in ["/", "/pricing", "/docs"] {
        assert!(pipeline.ingest(Event::new("page_view", json!({ "url": url }))).await);
    }
    assert!(pipeline.ingest(Event::new("purchase", json!({"value": 49, "transaction_id": "t-1"}))).await);

    assert_eq!(transport.sent_names(), vec![vec!["purchase".to_string()]]);
    assert_eq!(pipeline.stats().await.batch.pending, 3);

    pipeline.flush().await.unwrap();
    assert_eq!(transport.sent_names()[1], vec!["page_view"; 3]);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_ingest_rejects_invalid_and_duplicate() {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport.clone(), Signals::fixed())
        .await
        .unwrap();

    assert!(!pipeline.ingest(Event::new("", json!({}))).await);
    assert!(!pipeline.ingest_value(json!({"data": {"url": "/"}})).await);
    assert!(!pipeline.ingest_value(json!(17)).await);

    let event = Event::new("click", json!({"url": "/buy"})).with_id("evt-1");
    assert!(pipeline.ingest(event.clone()).await);
    assert!(!pipeline.ingest(event).await);

    // Same content and timestamp, different id: caught by fingerprint
    let a = Event::new("click", json!({"url": "/x"})).with_id("a").with_timestamp(1_000);
    let b = Event::new("click", json!({"url": "/x"})).with_id("b").with_timestamp(1_000);
    assert!(pipeline.ingest(a).await);
    assert!(!pipeline.ingest(b).await);

    assert!(pipeline.ingest_value(json!({"name": "scroll", "data": {"depth": 50}})).await);
    assert_eq!(pipeline.stats().await.dedup_entries, 3);

    pipeline.flush().await.unwrap();
    assert_eq!(transport.sent_count(), 3);
    pipeline.destroy();
}

#[tokio::test]
async fn test_double_fired_event_is_sent_once() {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport.clone(), Signals::fixed())
        .await
        .unwrap();

    let purchase = || Event::new("purchase", json!({"transaction_id": "T-1", "value": 10}));
    assert!(pipeline.ingest(purchase()).await);
    // Ids and timestamps filled in at ingest differ between the two
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!pipeline.ingest(purchase()).await);

    assert_eq!(transport.sent_names(), vec![vec!["purchase".to_string()]]);
    pipeline.destroy();
}

#[tokio::test]
async fn test_ids_stamped_at_ingest_reach_transport() {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport.clone(), Signals::fixed())
        .await
        .unwrap();

    assert!(
        pipeline
            .ingest_with(Event::new("page_view", json!({})), AddOptions::immediate())
            .await
    );
    let sent = transport.batches.lock()[0][0].clone();
    assert!(sent.id.is_some());
    assert!(sent.timestamp.is_some());
    pipeline.destroy();
}

#[tokio::test]
async fn test_ingest_after_destroy_is_refused() {
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport, Signals::fixed())
        .await
        .unwrap();
    pipeline.destroy();
    assert!(!pipeline.ingest(Event::new("page_view", json!({}))).await);
}

#[tokio::test]
async fn test_hidden_context_sends_by_beacon() {
    let transport = Arc::new(RecordingTransport::default());
    transport.beacon_available.store(true, Ordering::SeqCst);
    let (sources, signals) = SignalSources::new();
    let pipeline = RelayPipeline::new(RelayConfig::default(), transport.clone(), signals)
        .await
        .unwrap();

    assert!(pipeline.ingest(Event::new("page_view", json!({"url": "/a"}))).await);
    assert!(pipeline.ingest(Event::new("scroll", json!({"depth": 90}))).await);

    sources.set_visibility(telemetry_relay::Visibility::Hidden);
    wait_until(|| !transport.beacons.lock().is_empty()).await;

    assert_eq!(transport.beacons.lock()[0].len(), 2);
    assert!(transport.batches.lock().is_empty());
    pipeline.destroy();
}

// =============================================================================
// Persistence across restarts
// =============================================================================

#[tokio::test]
async fn test_queue_survives_restart_in_structured_tier() {
    let dir = tempfile::tempdir().unwrap();
    let url = sqlite_url(&dir);

    let down = Arc::new(RecordingTransport::default());
    down.down.store(true, Ordering::SeqCst);
    let (sources, signals) = SignalSources::new();
    sources.set_online(false);

    let storage = StorageManager::probe(vec![TierFactory::Structured { url: url.clone() }], None, None).await;
    assert_eq!(storage.tiers(), vec![TierKind::Structured]);
    let first = RelayPipeline::with_storage(RelayConfig::default(), down.clone(), signals, Arc::new(storage))
        .await
        .unwrap();

    assert!(first.ingest(Event::new("purchase", json!({"value": 10}))).await);
    assert!(first.ingest(Event::new("sign_up", json!({}))).await);
    assert_eq!(first.stats().await.queue.queued, 2);
    first.destroy();
    drop(first);

    // Fresh process: new manager over the same database file
    let healthy = Arc::new(RecordingTransport::default());
    let storage = StorageManager::probe(vec![TierFactory::Structured { url }], None, None).await;
    let second = RelayPipeline::with_storage(RelayConfig::default(), healthy.clone(), Signals::fixed(), Arc::new(storage))
        .await
        .unwrap();

    wait_until(|| healthy.sent_count() == 2).await;
    let mut names: Vec<String> = healthy.sent_names().into_iter().flatten().collect();
    names.sort();
    assert_eq!(names, vec!["purchase", "sign_up"]);

    for _ in 0..200 {
        if second.stats().await.queue.queued == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(second.stats().await.queue.queued, 0);
    second.destroy();
}

#[tokio::test]
async fn test_local_tier_shared_between_instances() {
    let local = Arc::new(LocalTier::default());
    let first = StorageManager::probe(vec![TierFactory::Shared(local.clone())], None, None).await;
    first.set("session", &json!({"user": "u-1"})).await;

    let second = StorageManager::probe(vec![TierFactory::Shared(local)], None, None).await;
    assert_eq!(second.get("session").await, Some(json!({"user": "u-1"})));
}

// =============================================================================
// Cross-context channel
// =============================================================================

#[tokio::test]
async fn test_other_context_sees_changes() {
    let hub = ChannelHub::new();
    let writer = StorageManager::probe(vec![TierFactory::Session], Some(hub.clone()), None).await;
    let reader = StorageManager::probe(vec![TierFactory::Session], Some(hub), None).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _subscription = reader.subscribe("consent", move |value| seen_clone.lock().push(value));

    writer.set("consent", &json!({"analytics": true})).await;
    writer.set("unrelated", &json!(1)).await;
    writer.remove("consent").await;
    // Own writes are not echoed
    reader.set("consent", &json!("local")).await;

    wait_until(|| seen.lock().len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock(), vec![Some(json!({"analytics": true})), None]);
}
