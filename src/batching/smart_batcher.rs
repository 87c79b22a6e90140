// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adaptive batching for telemetry delivery.
//!
//! The [`SmartBatcher`] collects events and hands them to a [`FlushSink`] in
//! batches. Whichever trigger fires first wins:
//!
//! - **Priority**: events at or above the priority threshold (or added with
//!   `immediate`) are delivered alone, right away
//! - **Size**: an event that would push the batch past `max_batch_bytes`
//!   flushes the current batch before it is appended
//! - **Count**: the batch reaches `max_batch_size` scaled by network quality
//! - **Time**: the flush timer fires; its interval adapts to how full the
//!   batch was at each tick
//! - **Teardown**: the context becomes hidden; the residual batch goes out
//!   through the sink's beacon path if it has one
//!
//! A failed flush puts its events back at the front of the batch and
//! schedules a retry flush.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use telemetry_relay::batching::{AddOptions, FlushMeta, FlushSink, SmartBatcher};
//! use telemetry_relay::config::BatchConfig;
//! use telemetry_relay::signals::Signals;
//! use telemetry_relay::{EnrichedEvent, Event, TransportError};
//!
//! struct Print;
//!
//! #[async_trait]
//! impl FlushSink for Print {
//!     async fn on_flush(&self, events: Vec<EnrichedEvent>, meta: FlushMeta) -> Result<(), TransportError> {
//!         println!("{} events ({:?})", events.len(), meta.reason);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let batcher = SmartBatcher::new(BatchConfig::default(), Arc::new(Print), Signals::fixed());
//! batcher.add(Event::new("page_view", serde_json::json!({})), AddOptions::default()).await.unwrap();
//! assert_eq!(batcher.stats().pending, 1);
//!
//! batcher.flush().await.unwrap();
//! assert_eq!(batcher.stats().pending, 0);
//! batcher.destroy();
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::event::{EnrichedEvent, Event};
use crate::metrics::{self, LatencyTimer};
use crate::signals::{NetworkSpeed, Signals, Visibility};
use crate::transport::TransportError;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Adjusted item count threshold reached
    Count,
    /// Byte size threshold would be exceeded
    Size,
    /// Flush timer fired
    Time,
    /// Manual flush requested
    Manual,
    /// High-priority or immediate event
    Priority,
    /// Context hidden or shutting down
    Teardown,
    /// Re-flush of a batch the sink rejected
    Retry,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Size => "size",
            Self::Time => "time",
            Self::Manual => "manual",
            Self::Priority => "priority",
            Self::Teardown => "teardown",
            Self::Retry => "retry",
        }
    }
}

/// Describes a batch handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushMeta {
    pub count: usize,
    pub bytes: usize,
    pub network_speed: NetworkSpeed,
    pub reason: FlushReason,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Deliver now regardless of priority
    pub immediate: bool,
}

impl AddOptions {
    #[must_use]
    pub fn immediate() -> Self {
        Self { immediate: true }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("flush failed: {0}")]
    Delivery(#[from] TransportError),

    #[error("batcher has been destroyed")]
    Destroyed,
}

/// Receives flushed batches.
#[async_trait]
pub trait FlushSink: Send + Sync {
    async fn on_flush(&self, events: Vec<EnrichedEvent>, meta: FlushMeta) -> Result<(), TransportError>;

    /// Best-effort delivery used on teardown. `false` means "not handed off",
    /// and the batcher falls back to [`on_flush`](Self::on_flush).
    async fn beacon(&self, _events: &[EnrichedEvent], _meta: &FlushMeta) -> bool {
        false
    }
}

/// Point-in-time batcher statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub pending: usize,
    pub pending_bytes: usize,
    pub flush_interval: Duration,
    /// Count threshold after network scaling
    pub max_batch_size: usize,
    pub flushes: u64,
    pub failures: u64,
}

/// Events pending flush
#[derive(Debug)]
struct Batch<T> {
    items: Vec<T>,
    total_bytes: usize,
}

impl<T> Batch<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            total_bytes: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn push(&mut self, item: T, size_bytes: usize) {
        self.items.push(item);
        self.total_bytes += size_bytes;
    }

    /// Put items back ahead of anything added since they were taken.
    fn prepend(&mut self, items: Vec<T>, size_bytes: usize) {
        self.items.splice(0..0, items);
        self.total_bytes += size_bytes;
    }

    fn take(&mut self) -> Option<(Vec<T>, usize)> {
        if self.items.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.total_bytes);
        Some((std::mem::take(&mut self.items), bytes))
    }
}

struct BatchState {
    batch: Batch<EnrichedEvent>,
    interval: Duration,
}

#[derive(Default)]
struct BatcherTasks {
    timer: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    visibility: Option<JoinHandle<()>>,
}

impl BatcherTasks {
    fn abort_all(&mut self) {
        for handle in [self.timer.take(), self.retry.take(), self.visibility.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: BatchConfig,
    sink: Arc<dyn FlushSink>,
    signals: Signals,
    state: Mutex<BatchState>,
    /// Serializes deliveries so batches never interleave at the sink
    delivery: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
    tasks: Mutex<BatcherTasks>,
    flushes: AtomicU64,
    failures: AtomicU64,
}

/// Adaptive event batcher. Must be created inside a tokio runtime.
pub struct SmartBatcher {
    inner: Arc<Inner>,
}

impl SmartBatcher {
    pub fn new(config: BatchConfig, sink: Arc<dyn FlushSink>, signals: Signals) -> Self {
        let interval = config
            .flush_interval()
            .clamp(config.min_flush_interval(), config.max_flush_interval());
        let visibility = signals.visibility.clone();

        let inner = Arc::new(Inner {
            config,
            sink,
            signals,
            state: Mutex::new(BatchState {
                batch: Batch::new(),
                interval,
            }),
            delivery: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(BatcherTasks::default()),
            flushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let timer = tokio::spawn(run_timer(Arc::downgrade(&inner)));
        let listener = tokio::spawn(watch_visibility(Arc::downgrade(&inner), visibility));
        {
            let mut tasks = inner.tasks.lock();
            tasks.timer = Some(timer);
            tasks.visibility = Some(listener);
        }
        metrics::set_flush_interval(interval);

        Self { inner }
    }

    /// Add an event.
    ///
    /// A delivery error means the triggered flush failed; the events stay
    /// buffered and a retry flush is scheduled.
    pub async fn add(&self, event: Event, options: AddOptions) -> Result<(), BatchError> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(BatchError::Destroyed);
        }

        let priority = inner.config.priorities.priority_of(&event.name);
        let enriched = EnrichedEvent::new(event, priority);
        let size = serde_json::to_vec(&enriched).map_or(0, |v| v.len());

        if options.immediate || priority >= inner.config.priority_threshold {
            let _delivery = inner.delivery.lock().await;
            return inner.deliver(vec![enriched], size, FlushReason::Priority).await;
        }

        let needs_room = {
            let state = inner.state.lock();
            !state.batch.is_empty() && state.batch.total_bytes + size > inner.config.max_batch_bytes
        };
        if needs_room {
            if let Err(e) = inner.flush_with(FlushReason::Size).await {
                debug!(error = %e, "Size flush failed, batch kept for retry");
            }
        }

        let full = {
            let mut state = inner.state.lock();
            state.batch.push(enriched, size);
            state.batch.len() >= inner.effective_max_batch_size()
        };
        if full {
            return inner.flush_with(FlushReason::Count).await;
        }
        Ok(())
    }

    /// Flush whatever is pending. No-op when empty.
    pub async fn flush(&self) -> Result<(), BatchError> {
        if self.inner.is_destroyed() {
            return Err(BatchError::Destroyed);
        }
        self.inner.flush_with(FlushReason::Manual).await
    }

    /// Stop all timers and listeners. Pending events are not flushed; a
    /// delivery already under way completes but arms nothing new.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tasks.lock().abort_all();
        let pending = self.inner.state.lock().batch.len();
        info!(pending, "Batcher destroyed");
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let state = self.inner.state.lock();
        BatchStats {
            pending: state.batch.len(),
            pending_bytes: state.batch.total_bytes,
            flush_interval: state.interval,
            max_batch_size: self.inner.effective_max_batch_size(),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl Drop for SmartBatcher {
    fn drop(&mut self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.tasks.lock().abort_all();
    }
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn effective_max_batch_size(&self) -> usize {
        scaled_batch_size(self.config.max_batch_size, self.signals.network_speed())
    }

    async fn flush_with(self: &Arc<Self>, reason: FlushReason) -> Result<(), BatchError> {
        let _delivery = self.delivery.lock().await;
        let taken = {
            let mut state = self.state.lock();
            state.batch.take()
        };
        let Some((events, bytes)) = taken else {
            return Ok(());
        };
        self.deliver(events, bytes, reason).await
    }

    /// Hand `events` to the sink. Caller holds the delivery lock.
    async fn deliver(
        self: &Arc<Self>,
        events: Vec<EnrichedEvent>,
        bytes: usize,
        reason: FlushReason,
    ) -> Result<(), BatchError> {
        let meta = self.meta_for(&events, bytes, reason);
        let result = {
            let _timer = LatencyTimer::new("batch", "on_flush");
            self.sink.on_flush(events.clone(), meta.clone()).await
        };

        match result {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                metrics::record_flush(reason.as_str(), "success");
                metrics::record_batch_size(reason.as_str(), meta.count);
                metrics::record_batch_bytes(reason.as_str(), meta.bytes);
                debug!(count = meta.count, bytes = meta.bytes, reason = reason.as_str(), "Batch flushed");
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_flush(reason.as_str(), "error");
                warn!(count = meta.count, reason = reason.as_str(), error = %e, "Flush failed, requeueing batch");
                self.state.lock().batch.prepend(events, bytes);
                self.schedule_retry();
                Err(BatchError::Delivery(e))
            }
        }
    }

    fn meta_for(&self, events: &[EnrichedEvent], bytes: usize, reason: FlushReason) -> FlushMeta {
        FlushMeta {
            count: events.len(),
            bytes,
            network_speed: self.signals.network_speed(),
            reason,
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks.retry.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.config.retry_flush_delay();
        debug!(?delay, "Retry flush scheduled");
        tasks.retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.is_destroyed() {
                return;
            }
            // Free the slot so a failure here can schedule the next retry
            inner.tasks.lock().retry = None;
            run_detached(async move {
                if let Err(e) = inner.flush_with(FlushReason::Retry).await {
                    debug!(error = %e, "Retry flush failed");
                }
            })
            .await;
        }));
    }

    async fn on_tick(self: &Arc<Self>) {
        let (fill_ratio, interval) = {
            let mut state = self.state.lock();
            let fill_ratio = state.batch.len() as f64 / self.effective_max_batch_size() as f64;
            state.interval = adapt_interval(
                state.interval,
                fill_ratio,
                self.config.min_flush_interval(),
                self.config.max_flush_interval(),
            );
            (fill_ratio, state.interval)
        };
        metrics::set_flush_interval(interval);

        if fill_ratio > 0.0 {
            if let Err(e) = self.flush_with(FlushReason::Time).await {
                debug!(error = %e, "Timed flush failed");
            }
        }
    }

    async fn on_hidden(self: &Arc<Self>) {
        let _delivery = self.delivery.lock().await;
        let taken = {
            let mut state = self.state.lock();
            state.batch.take()
        };
        let Some((events, bytes)) = taken else {
            return;
        };

        let meta = self.meta_for(&events, bytes, FlushReason::Teardown);
        if self.sink.beacon(&events, &meta).await {
            metrics::record_beacon(true);
            self.flushes.fetch_add(1, Ordering::Relaxed);
            debug!(count = meta.count, "Residual batch sent by beacon");
            return;
        }
        metrics::record_beacon(false);

        if let Err(e) = self.deliver(events, bytes, FlushReason::Teardown).await {
            warn!(error = %e, "Teardown flush failed");
        }
    }
}

async fn run_timer(handle: Weak<Inner>) {
    loop {
        let interval = match handle.upgrade() {
            Some(inner) if !inner.is_destroyed() => inner.state.lock().interval,
            _ => break,
        };
        sleep(interval).await;

        let Some(inner) = handle.upgrade() else { break };
        if inner.is_destroyed() {
            break;
        }
        run_detached(async move { inner.on_tick().await }).await;
    }
}

async fn watch_visibility(handle: Weak<Inner>, mut visibility: watch::Receiver<Visibility>) {
    while visibility.changed().await.is_ok() {
        let hidden = *visibility.borrow_and_update() == Visibility::Hidden;
        if !hidden {
            continue;
        }
        let Some(inner) = handle.upgrade() else { break };
        if inner.is_destroyed() {
            break;
        }
        run_detached(async move { inner.on_hidden().await }).await;
    }
}

/// Run a delivery on its own task. Aborting the awaiting task (on destroy)
/// detaches it instead of dropping a batch that was already taken.
async fn run_detached<F>(work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(work).await {
        if e.is_panic() {
            warn!(error = %e, "Batch delivery task panicked");
        }
    }
}

/// `max_batch_size` scaled for network quality, never below one.
#[must_use]
pub fn scaled_batch_size(max_batch_size: usize, speed: NetworkSpeed) -> usize {
    ((max_batch_size as f64 * speed.batch_multiplier()).round() as usize).max(1)
}

/// Next timer interval given how full the batch was at the tick.
#[must_use]
pub fn adapt_interval(current: Duration, fill_ratio: f64, min: Duration, max: Duration) -> Duration {
    if fill_ratio > 0.8 {
        current.mul_f64(0.5).max(min)
    } else if fill_ratio < 0.1 {
        current.mul_f64(1.2).min(max)
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalSources;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        flushed: Mutex<Vec<(Vec<EnrichedEvent>, FlushMeta)>>,
        beaconed: Mutex<Vec<Vec<EnrichedEvent>>>,
        fail: AtomicBool,
        beacon_ok: AtomicBool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            let sink = Self::default();
            sink.fail.store(true, Ordering::SeqCst);
            sink
        }

        fn flushes(&self) -> Vec<(Vec<EnrichedEvent>, FlushMeta)> {
            self.flushed.lock().clone()
        }
    }

    #[async_trait]
    impl FlushSink for RecordingSink {
        async fn on_flush(&self, events: Vec<EnrichedEvent>, meta: FlushMeta) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Unavailable("test".into()));
            }
            self.flushed.lock().push((events, meta));
            Ok(())
        }

        async fn beacon(&self, events: &[EnrichedEvent], _meta: &FlushMeta) -> bool {
            if !self.beacon_ok.load(Ordering::SeqCst) {
                return false;
            }
            self.beaconed.lock().push(events.to_vec());
            true
        }
    }

    /// Timer far enough out that only the test's own triggers flush
    fn quiet_config() -> BatchConfig {
        BatchConfig {
            flush_interval_ms: 600_000,
            min_flush_interval_ms: 600_000,
            max_flush_interval_ms: 600_000,
            ..Default::default()
        }
    }

    fn page_view(i: usize) -> Event {
        Event::new("page_view", json!({ "url": format!("/page/{i}") }))
    }

    #[test]
    fn test_scaled_batch_size() {
        assert_eq!(scaled_batch_size(50, NetworkSpeed::Slow2g), 10);
        assert_eq!(scaled_batch_size(50, NetworkSpeed::TwoG), 15);
        assert_eq!(scaled_batch_size(50, NetworkSpeed::ThreeG), 30);
        assert_eq!(scaled_batch_size(50, NetworkSpeed::FourG), 50);
        assert_eq!(scaled_batch_size(50, NetworkSpeed::Unknown), 50);
        assert_eq!(scaled_batch_size(2, NetworkSpeed::Slow2g), 1);
    }

    #[test]
    fn test_adapt_interval() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let five = Duration::from_secs(5);

        assert_eq!(adapt_interval(five, 0.9, min, max), Duration::from_millis(2500));
        assert_eq!(adapt_interval(five, 0.05, min, max), Duration::from_secs(6));
        assert_eq!(adapt_interval(five, 0.5, min, max), five);
        // Bounded both ways
        assert_eq!(adapt_interval(Duration::from_millis(1500), 1.0, min, max), min);
        assert_eq!(adapt_interval(Duration::from_secs(28), 0.0, min, max), max);
    }

    #[test]
    fn test_batch_prepend_keeps_order() {
        let mut batch = Batch::new();
        batch.push("c", 1);
        batch.prepend(vec!["a", "b"], 2);
        assert_eq!(batch.items, vec!["a", "b", "c"]);
        assert_eq!(batch.total_bytes, 3);
        assert_eq!(batch.take(), Some((vec!["a", "b", "c"], 3)));
        assert_eq!(batch.take(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_event_bypasses_batch() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        batcher
            .add(Event::new("purchase", json!({"value": 10})), AddOptions::default())
            .await
            .unwrap();

        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0.len(), 1);
        assert_eq!(flushes[0].0[0].event.name, "purchase");
        assert_eq!(flushes[0].0[0].priority, 100);
        assert_eq!(flushes[0].1.reason, FlushReason::Priority);
        // The low-priority event is still waiting
        assert_eq!(batcher.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_option_bypasses_batch() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::immediate()).await.unwrap();
        assert_eq!(sink.flushes().len(), 1);
        assert_eq!(batcher.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_adapts_to_2g() {
        let sink = Arc::new(RecordingSink::default());
        let (_sources, signals) =
            SignalSources::with_initial(true, Visibility::Visible, NetworkSpeed::TwoG);
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), signals);
        assert_eq!(batcher.stats().max_batch_size, 15);

        for i in 0..14 {
            batcher.add(page_view(i), AddOptions::default()).await.unwrap();
        }
        assert!(sink.flushes().is_empty());

        batcher.add(page_view(14), AddOptions::default()).await.unwrap();
        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0.len(), 15);
        assert_eq!(flushes[0].1.reason, FlushReason::Count);
        assert_eq!(flushes[0].1.network_speed, NetworkSpeed::TwoG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_applies_to_next_add() {
        let sink = Arc::new(RecordingSink::default());
        let (sources, signals) = SignalSources::new();
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), signals);

        for i in 0..10 {
            batcher.add(page_view(i), AddOptions::default()).await.unwrap();
        }
        assert!(sink.flushes().is_empty());

        sources.set_network_speed(NetworkSpeed::Slow2g);
        batcher.add(page_view(10), AddOptions::default()).await.unwrap();
        assert_eq!(sink.flushes()[0].0.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_limit_flushes_before_append() {
        let probe = EnrichedEvent::new(page_view(0), 20);
        let one = serde_json::to_vec(&probe).unwrap().len();

        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            max_batch_bytes: one * 2 + one / 2,
            ..quiet_config()
        };
        let batcher = SmartBatcher::new(config, sink.clone(), Signals::fixed());

        for i in 1..=3 {
            batcher.add(page_view(i), AddOptions::default()).await.unwrap();
        }

        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].0.len(), 2);
        assert_eq!(flushes[0].1.reason, FlushReason::Size);
        assert_eq!(batcher.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_reinserts_and_retries() {
        let sink = Arc::new(RecordingSink::failing());
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        batcher.add(page_view(2), AddOptions::default()).await.unwrap();

        let err = batcher.flush().await.unwrap_err();
        assert!(matches!(err, BatchError::Delivery(TransportError::Unavailable(_))));
        assert_eq!(batcher.stats().pending, 2);
        assert_eq!(batcher.stats().failures, 1);

        // Added after the failure; must land behind the reinserted events
        batcher.add(page_view(3), AddOptions::default()).await.unwrap();
        sink.fail.store(false, Ordering::SeqCst);

        sleep(Duration::from_secs(6)).await;

        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1.reason, FlushReason::Retry);
        let urls: Vec<_> = flushes[0].0.iter().map(|e| e.event.data["url"].clone()).collect();
        assert_eq!(urls, vec![json!("/page/1"), json!("/page/2"), json!("/page/3")]);
        assert_eq!(batcher.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_survive_failed_flush() {
        let sink = Arc::new(RecordingSink::failing());
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), Signals::fixed());

        let mut event = page_view(1);
        let id = event.stamp().to_string();
        batcher.add(event, AddOptions::default()).await.unwrap();
        assert!(batcher.flush().await.is_err());

        sink.fail.store(false, Ordering::SeqCst);
        batcher.flush().await.unwrap();
        assert_eq!(sink.flushes()[0].0[0].batch_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_and_interval_adapts() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            max_batch_size: 10,
            flush_interval_ms: 5_000,
            min_flush_interval_ms: 1_000,
            max_flush_interval_ms: 30_000,
            ..Default::default()
        };
        let batcher = SmartBatcher::new(config, sink.clone(), Signals::fixed());

        // Fill ratio 0.9 at the first tick: interval halves
        for i in 0..9 {
            batcher.add(page_view(i), AddOptions::default()).await.unwrap();
        }
        sleep(Duration::from_millis(5_100)).await;

        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1.reason, FlushReason::Time);
        assert_eq!(batcher.stats().flush_interval, Duration::from_millis(2_500));

        // Empty at the next tick: interval grows by 1.2
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(batcher.stats().flush_interval, Duration::from_millis(3_000));
        assert_eq!(sink.flushes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_uses_beacon() {
        let sink = Arc::new(RecordingSink::default());
        sink.beacon_ok.store(true, Ordering::SeqCst);
        let (sources, signals) = SignalSources::new();
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), signals);

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        batcher.add(page_view(2), AddOptions::default()).await.unwrap();

        sources.set_visibility(Visibility::Hidden);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.beaconed.lock().len(), 1);
        assert_eq!(sink.beaconed.lock()[0].len(), 2);
        assert!(sink.flushes().is_empty());
        assert_eq!(batcher.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_without_beacon_flushes_normally() {
        let sink = Arc::new(RecordingSink::default());
        let (sources, signals) = SignalSources::new();
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), signals);

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        sources.set_visibility(Visibility::Hidden);
        sleep(Duration::from_millis(10)).await;

        let flushes = sink.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1.reason, FlushReason::Teardown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_everything() {
        let sink = Arc::new(RecordingSink::default());
        let config = BatchConfig {
            flush_interval_ms: 1_000,
            min_flush_interval_ms: 1_000,
            ..Default::default()
        };
        let batcher = SmartBatcher::new(config, sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        batcher.destroy();
        batcher.destroy();

        sleep(Duration::from_secs(10)).await;
        assert!(sink.flushes().is_empty());
        assert!(batcher.is_destroyed());

        let err = batcher.add(page_view(2), AddOptions::default()).await.unwrap_err();
        assert!(matches!(err, BatchError::Destroyed));
        assert!(matches!(batcher.flush().await, Err(BatchError::Destroyed)));
    }

    /// Holds every delivery until a permit is released
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        entered: AtomicU64,
        delivered: Mutex<Vec<EnrichedEvent>>,
    }

    impl GatedSink {
        fn closed() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                entered: AtomicU64::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FlushSink for GatedSink {
        async fn on_flush(&self, events: Vec<EnrichedEvent>, _meta: FlushMeta) -> Result<(), TransportError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|_| TransportError::Unavailable("gate closed".into()))?
                .forget();
            self.delivered.lock().extend(events);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_lets_timed_flush_finish() {
        let sink = Arc::new(GatedSink::closed());
        let config = BatchConfig {
            flush_interval_ms: 1_000,
            min_flush_interval_ms: 1_000,
            max_flush_interval_ms: 1_000,
            ..Default::default()
        };
        let batcher = SmartBatcher::new(config, sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        sleep(Duration::from_millis(1_100)).await;
        // Timer flush has taken the batch and is waiting on the sink
        assert_eq!(sink.entered.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.stats().pending, 0);

        batcher.destroy();
        sink.gate.add_permits(1);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(batcher.stats().flushes, 1);

        // Nothing re-armed after destroy
        sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_failing_retry_keeps_events() {
        let sink = Arc::new(RecordingSink::failing());
        let config = BatchConfig {
            retry_flush_delay_ms: 1_000,
            ..quiet_config()
        };
        let batcher = SmartBatcher::new(config, sink.clone(), Signals::fixed());

        batcher.add(page_view(1), AddOptions::default()).await.unwrap();
        assert!(batcher.flush().await.is_err());
        batcher.destroy();
        sleep(Duration::from_secs(5)).await;

        assert!(sink.flushes().is_empty());
        assert_eq!(batcher.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_empty_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = SmartBatcher::new(quiet_config(), sink.clone(), Signals::fixed());
        batcher.flush().await.unwrap();
        assert!(sink.flushes().is_empty());
        assert_eq!(batcher.stats().flushes, 0);
    }
}
