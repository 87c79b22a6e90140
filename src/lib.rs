//! # Telemetry Relay
//!
//! Resilient delivery for short-lived telemetry events produced in a context
//! that may go offline, be backgrounded, or be torn down without notice.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingest Layer                         │
//! │  • Validates events, stamps id + timestamp once            │
//! │  • Deduplicator: id cache + content fingerprint cache      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SmartBatcher                         │
//! │  • Priority bypass for high-value events                   │
//! │  • Batch size scaled by network quality                    │
//! │  • Adaptive flush timer, beacon flush on teardown          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (Transport::send, failures ↓)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PersistentRetryQueue                      │
//! │  • Priority-aware bounded queue with backoff               │
//! │  • Syncs on reconnect, wake-up, and schedule               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StorageManager                         │
//! │  • Local → Session → Structured (SQLite) → Header          │
//! │  • Write to all, read first hit, tagged zstd records       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use telemetry_relay::{Event, RelayConfig, RelayPipeline, SignalSources, Transport, TransportError};
//!
//! struct Collector;
//!
//! #[async_trait]
//! impl Transport for Collector {
//!     async fn send(&self, events: &[Event]) -> Result<(), TransportError> {
//!         println!("sending {} events", events.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (sources, signals) = SignalSources::new();
//!     let pipeline = RelayPipeline::new(RelayConfig::default(), Arc::new(Collector), signals)
//!         .await
//!         .expect("Failed to open pipeline");
//!
//!     pipeline.ingest(Event::new("page_view", json!({"url": "/pricing"}))).await;
//!     pipeline.ingest(Event::new("purchase", json!({"value": 49}))).await;
//!
//!     // The host reports connectivity changes
//!     sources.set_online(false);
//!     sources.set_online(true);
//!
//!     pipeline.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: [`RelayPipeline`] composing every stage behind `ingest()`
//! - [`dedup`]: id and fingerprint duplicate detection
//! - [`batching`]: adaptive batcher
//! - [`queue`]: persistent retry queue
//! - [`storage`]: storage tiers, record codec, cross-context change channel
//! - [`signals`]: connectivity, visibility, network quality, wake-up
//! - [`resilience`]: backoff schedules and retry helpers

pub mod batching;
pub mod config;
pub mod dedup;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod priority;
pub mod queue;
pub mod resilience;
pub mod signals;
pub mod storage;
pub mod transport;

pub use batching::{AddOptions, BatchError, FlushMeta, FlushReason, FlushSink, SmartBatcher};
pub use config::{BatchConfig, DedupConfig, QueueConfig, RelayConfig, StorageConfig};
pub use dedup::Deduplicator;
pub use event::{EnrichedEvent, Event};
pub use metrics::LatencyTimer;
pub use pipeline::{PipelineStats, RelayPipeline};
pub use priority::{HighPrioritySet, PriorityTable};
pub use queue::{PersistentRetryQueue, QueueError, QueueItem, QueueStats, SyncSink};
pub use resilience::retry::{BackoffSchedule, RetryConfig};
pub use signals::{NetworkSpeed, SignalSources, Signals, Visibility};
pub use storage::{ChannelHub, StorageError, StorageManager, TierFactory, TierKind};
pub use transport::{Transport, TransportError};
