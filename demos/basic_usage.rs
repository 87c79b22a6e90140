// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic telemetry-relay usage example.
//!
//! Demonstrates:
//! 1. Assembling a pipeline over in-memory tiers and a toy collector
//! 2. Ingesting events, including a duplicate and a priority bypass
//! 3. Riding out a collector outage through the retry queue
//! 4. Draining the queue on reconnect
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use telemetry_relay::{Event, RelayConfig, RelayPipeline, SignalSources, Transport, TransportError};

/// Prints what it receives; can be switched off to simulate an outage.
struct ConsoleCollector {
    down: AtomicBool,
}

#[async_trait]
impl Transport for ConsoleCollector {
    async fn send(&self, events: &[Event]) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("collector offline".into()));
        }
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        println!("   📨 collector received {} event(s): {:?}", events.len(), names);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          telemetry-relay: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Assemble the pipeline
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔧 Assembling pipeline...");
    let collector = Arc::new(ConsoleCollector {
        down: AtomicBool::new(false),
    });
    let (sources, signals) = SignalSources::new();
    let pipeline = RelayPipeline::new(RelayConfig::default(), collector.clone(), signals).await?;
    println!("   └─ Storage tiers: {:?}", pipeline.storage().tiers());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Ingest
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Ingesting events...");
    for url in ["/", "/pricing", "/docs"] {
        let accepted = pipeline.ingest(Event::new("page_view", json!({ "url": url }))).await;
        println!("   └─ page_view {url}: accepted={accepted}");
    }

    let click = Event::new("click", json!({"url": "/signup"})).with_id("click-1");
    println!("   └─ click: accepted={}", pipeline.ingest(click.clone()).await);
    println!("   └─ click again: accepted={} (duplicate)", pipeline.ingest(click).await);

    println!("   └─ purchase bypasses the batch:");
    pipeline.ingest(Event::new("purchase", json!({"value": 49, "transaction_id": "t-42"}))).await;

    let stats = pipeline.stats().await;
    println!("   └─ Pending in batch: {}", stats.batch.pending);
    pipeline.flush().await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Collector outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔌 Going offline...");
    collector.down.store(true, Ordering::SeqCst);
    sources.set_online(false);
    pipeline.ingest(Event::new("checkout", json!({"value": 120}))).await;
    pipeline.ingest(Event::new("add_to_cart", json!({"sku": "A-1"}))).await;
    pipeline.flush().await?;
    let stats = pipeline.stats().await;
    println!("   └─ Queued for retry: {} (high priority: {})", stats.queue.queued, stats.queue.high_priority);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🌐 Back online, draining queue...");
    collector.down.store(false, Ordering::SeqCst);
    sources.set_online(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("   └─ Still queued: {}", pipeline.stats().await.queue.queued);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    pipeline.shutdown().await;
    println!("   ✅ Shutdown complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, avg) in &histograms {
            println!("      └─ {}{} n={} avg={:.4}", name, labels, count, avg);
        }
    }
}
