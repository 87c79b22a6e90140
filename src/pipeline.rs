// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The assembled delivery pipeline.
//!
//! ```text
//! ingest(event)
//!   │ stamp id + timestamp
//!   ▼
//! Deduplicator ── duplicate ──► false
//!   │
//!   ▼
//! SmartBatcher ── flush ──► Transport::send
//!                              │ error
//!                              ▼
//!                   PersistentRetryQueue ── sync pass ──► Transport::send
//!                              │
//!                              ▼
//!                        StorageManager
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batching::{AddOptions, BatchError, BatchStats, FlushMeta, FlushSink, SmartBatcher};
use crate::config::RelayConfig;
use crate::dedup::Deduplicator;
use crate::event::{EnrichedEvent, Event};
use crate::metrics;
use crate::queue::{PersistentRetryQueue, QueueError, QueueStats, SyncReport, SyncSink};
use crate::signals::Signals;
use crate::storage::{ChannelHub, StorageManager};
use crate::transport::{Transport, TransportError};

/// Flushed batches go to the transport; failures fall through to the queue.
struct TransportFlushSink {
    transport: Arc<dyn Transport>,
    queue: Arc<PersistentRetryQueue>,
}

#[async_trait]
impl FlushSink for TransportFlushSink {
    async fn on_flush(&self, events: Vec<EnrichedEvent>, meta: FlushMeta) -> Result<(), TransportError> {
        let events: Vec<Event> = events.into_iter().map(EnrichedEvent::into_event).collect();
        let sent = {
            let _timer = metrics::LatencyTimer::new("transport", "send");
            self.transport.send(&events).await
        };
        let Err(e) = sent else {
            return Ok(());
        };

        warn!(count = meta.count, reason = meta.reason.as_str(), error = %e, "Send failed, handing batch to retry queue");
        let mut rejected = 0;
        for event in events {
            if !self.queue.add(event).await {
                rejected += 1;
            }
        }
        if rejected == 0 {
            Ok(())
        } else {
            warn!(rejected, "Retry queue refused events, keeping them in the batch");
            Err(e)
        }
    }

    async fn beacon(&self, events: &[EnrichedEvent], _meta: &FlushMeta) -> bool {
        let events: Vec<Event> = events.iter().map(|e| e.event.clone()).collect();
        self.transport.beacon(&events).await
    }
}

struct TransportSyncSink {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl SyncSink for TransportSyncSink {
    async fn on_sync(&self, events: Vec<Event>) -> Result<(), TransportError> {
        let _timer = metrics::LatencyTimer::new("transport", "send");
        self.transport.send(&events).await
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub batch: BatchStats,
    pub queue: QueueStats,
    pub dedup_entries: usize,
}

/// Dedup → batch → send, with a persistent retry queue behind the transport.
pub struct RelayPipeline {
    dedup: Deduplicator,
    batcher: SmartBatcher,
    queue: Arc<PersistentRetryQueue>,
    storage: Arc<StorageManager>,
}

impl RelayPipeline {
    /// Probe the storage tiers named in `config` and assemble the pipeline.
    pub async fn new(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        signals: Signals,
    ) -> Result<Self, QueueError> {
        let hub = ChannelHub::with_capacity(config.storage.channel_capacity);
        let storage = Arc::new(StorageManager::from_config(&config.storage, Some(hub)).await);
        Self::with_storage(config, transport, signals, storage).await
    }

    /// Assemble over an existing storage manager.
    #[tracing::instrument(skip_all)]
    pub async fn with_storage(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        signals: Signals,
        storage: Arc<StorageManager>,
    ) -> Result<Self, QueueError> {
        let queue = Arc::new(
            PersistentRetryQueue::open(
                config.queue,
                storage.clone(),
                Arc::new(TransportSyncSink {
                    transport: transport.clone(),
                }),
                signals.clone(),
            )
            .await?,
        );

        let sink = Arc::new(TransportFlushSink {
            transport,
            queue: queue.clone(),
        });
        let batcher = SmartBatcher::new(config.batch, sink, signals);

        info!(tiers = ?storage.tiers(), "Relay pipeline ready");
        Ok(Self {
            dedup: Deduplicator::from_config(&config.dedup),
            batcher,
            queue,
            storage,
        })
    }

    /// Accept an event. `false` for invalid events, duplicates, and after shutdown.
    pub async fn ingest(&self, event: Event) -> bool {
        self.ingest_with(event, AddOptions::default()).await
    }

    /// Accept raw JSON; anything that doesn't parse as an event is refused.
    pub async fn ingest_value(&self, value: Value) -> bool {
        match Event::from_value(value) {
            Some(event) => self.ingest(event).await,
            None => {
                metrics::record_ingest("invalid");
                false
            }
        }
    }

    pub async fn ingest_with(&self, mut event: Event, options: AddOptions) -> bool {
        if !event.is_valid() {
            metrics::record_ingest("invalid");
            return false;
        }
        event.stamp();

        if !self.dedup.admit(&event) {
            metrics::record_ingest("duplicate");
            return false;
        }

        match self.batcher.add(event, options).await {
            Ok(()) => {
                metrics::record_ingest("accepted");
                true
            }
            Err(BatchError::Delivery(e)) => {
                // Still buffered; the batcher retries it
                debug!(error = %e, "Flush after ingest failed");
                metrics::record_ingest("accepted");
                true
            }
            Err(BatchError::Destroyed) => {
                metrics::record_ingest("rejected");
                false
            }
        }
    }

    pub async fn flush(&self) -> Result<(), BatchError> {
        self.batcher.flush().await
    }

    /// Retry queued events now.
    pub async fn sync_now(&self) -> SyncReport {
        self.queue.sync_now().await
    }

    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            batch: self.batcher.stats(),
            queue: self.queue.stats().await,
            dedup_entries: self.dedup.len(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    #[must_use]
    pub fn queue(&self) -> &PersistentRetryQueue {
        &self.queue
    }

    /// Flush what is pending, then stop every background task.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.batcher.is_destroyed() {
            if let Err(e) = self.batcher.flush().await {
                warn!(error = %e, "Final flush failed");
            }
        }
        self.destroy();
    }

    /// Stop every background task without flushing.
    pub fn destroy(&self) {
        self.batcher.destroy();
        self.queue.destroy();
    }
}
