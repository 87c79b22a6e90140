// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable retry queue for events the transport could not deliver.
//!
//! # Item lifecycle
//!
//! ```text
//! add ──► queued ──► attempting ──┬──► delivered (removed)
//!            ▲                    │
//!            └── backoff delay ◄──┤ failure (attempts += 1)
//!                                 │
//!                                 └──► failed (attempts == max_retries)
//!                                        │
//!                                        └──► purged at load once stale
//! ```
//!
//! Every mutation is written through the [`StorageManager`] under one key,
//! so a new queue opened over the same tiers picks up where the last one
//! stopped. A sync pass runs on `add` (when online), on the offline → online
//! transition, when the context becomes visible again, on host wake-ups,
//! after the backoff delay, and optionally on a slow background interval.
//! A trigger that lands mid-pass makes the running pass go round again.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::event::{now_millis, Event};
use crate::metrics;
use crate::resilience::retry::BackoffSchedule;
use crate::signals::{Signals, Visibility};
use crate::storage::StorageManager;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Delivers queued events during a sync pass.
#[async_trait]
pub trait SyncSink: Send + Sync {
    async fn on_sync(&self, events: Vec<Event>) -> Result<(), TransportError>;
}

/// One queued event and its delivery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub event: Event,
    pub enqueued_at: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub failed: bool,
}

impl QueueItem {
    fn new(id: String, event: Event) -> Self {
        Self {
            id,
            event,
            enqueued_at: now_millis(),
            attempts: 0,
            last_attempt_at: None,
            failed: false,
        }
    }

    /// Failed and untouched for longer than `stale_after_ms`.
    #[must_use]
    pub fn is_stale(&self, now: i64, stale_after_ms: u64) -> bool {
        let last_touched = self.last_attempt_at.unwrap_or(self.enqueued_at);
        self.failed && now.saturating_sub(last_touched) > stale_after_ms as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// All items, failed ones included
    pub queued: usize,
    pub failed: usize,
    pub processing: bool,
    pub is_online: bool,
    /// Items whose event name is in the high-priority set
    pub high_priority: usize,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: usize,
    pub failed: usize,
    /// Marked failed this pass after running out of retries
    pub exhausted: usize,
    /// Another pass was already running
    pub skipped: bool,
}

struct QueueState {
    items: Vec<QueueItem>,
    processing: bool,
    /// A trigger arrived while a pass was running
    rerun: bool,
}

#[derive(Default)]
struct QueueTasks {
    retry: Option<JoinHandle<()>>,
    online: Option<JoinHandle<()>>,
    visibility: Option<JoinHandle<()>>,
    wake: Option<JoinHandle<()>>,
    background: Option<JoinHandle<()>>,
}

impl QueueTasks {
    fn abort_all(&mut self) {
        for handle in [
            self.retry.take(),
            self.online.take(),
            self.visibility.take(),
            self.wake.take(),
            self.background.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Shared {
    config: QueueConfig,
    schedule: BackoffSchedule,
    storage: Arc<StorageManager>,
    sink: Arc<dyn SyncSink>,
    signals: Signals,
    state: Mutex<QueueState>,
    destroyed: AtomicBool,
    tasks: parking_lot::Mutex<QueueTasks>,
}

pub struct PersistentRetryQueue {
    shared: Arc<Shared>,
}

impl PersistentRetryQueue {
    /// Rehydrate from storage and start listening for sync triggers.
    #[tracing::instrument(skip_all, fields(key = %config.storage_key))]
    pub async fn open(
        config: QueueConfig,
        storage: Arc<StorageManager>,
        sink: Arc<dyn SyncSink>,
        signals: Signals,
    ) -> Result<Self, QueueError> {
        let (items, purged) = load_items(&storage, &config).await;
        if purged > 0 {
            metrics::record_stale_purged(purged);
            storage.set(&config.storage_key, &serde_json::to_value(&items)?).await;
        }
        info!(items = items.len(), purged, "Retry queue loaded");
        metrics::set_queue_depth(items.len());

        let has_pending = items.iter().any(|i| !i.failed);
        let shared = Arc::new(Shared {
            schedule: BackoffSchedule::from_millis(&config.retry_delays_ms),
            config,
            storage,
            sink,
            state: Mutex::new(QueueState {
                items,
                processing: false,
                rerun: false,
            }),
            destroyed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(QueueTasks::default()),
            signals,
        });

        let online = tokio::spawn(watch_online(Arc::downgrade(&shared), shared.signals.online.clone()));
        let visibility = tokio::spawn(watch_visibility(
            Arc::downgrade(&shared),
            shared.signals.visibility.clone(),
        ));
        let wake = tokio::spawn(watch_wake(Arc::downgrade(&shared), shared.signals.wake.clone()));
        let background = shared.config.background_sync.then(|| {
            tokio::spawn(run_background(
                Arc::downgrade(&shared),
                shared.config.background_sync_interval(),
            ))
        });
        {
            let mut tasks = shared.tasks.lock();
            tasks.online = Some(online);
            tasks.visibility = Some(visibility);
            tasks.wake = Some(wake);
            tasks.background = background;
        }

        if has_pending && shared.signals.is_online() {
            shared.kick();
        }
        Ok(Self { shared })
    }

    /// Queue an event for delivery. `false` if it is invalid, the queue is
    /// destroyed, or the queue is full of high-priority items.
    pub async fn add(&self, mut event: Event) -> bool {
        let shared = &self.shared;
        if shared.is_destroyed() || !event.is_valid() {
            return false;
        }
        let id = event.stamp().to_string();

        {
            let mut state = shared.state.lock().await;
            if state.items.iter().any(|i| i.id == id) {
                return true;
            }

            if state.items.len() >= shared.config.max_queue_size {
                match shared.eviction_candidate(&state.items) {
                    Some(idx) => {
                        let evicted = state.items.remove(idx);
                        warn!(evicted = %evicted.id, name = %evicted.event.name, "Queue full, evicted lowest-priority item");
                        metrics::record_queue_eviction();
                    }
                    None => {
                        warn!(id = %id, name = %event.name, "Queue full of high-priority items, rejecting");
                        metrics::record_queue_rejection();
                        return false;
                    }
                }
            }

            state.items.push(QueueItem::new(id, event));
            shared.persist(&state.items).await;
        }

        if shared.signals.is_online() {
            shared.kick();
        }
        true
    }

    /// Run a sync pass now and wait for it.
    pub async fn sync_now(&self) -> SyncReport {
        self.shared.run_pass().await
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().await;
        QueueStats {
            queued: state.items.len(),
            failed: state.items.iter().filter(|i| i.failed).count(),
            processing: state.processing,
            is_online: self.shared.signals.is_online(),
            high_priority: state
                .items
                .iter()
                .filter(|i| self.shared.config.high_priority_events.contains(&i.event.name))
                .count(),
        }
    }

    /// Snapshot of the queue contents in insertion order.
    pub async fn items(&self) -> Vec<QueueItem> {
        self.shared.state.lock().await.items.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.shared.state.lock().await;
        state.items.clear();
        self.shared.storage.remove(&self.shared.config.storage_key).await;
        metrics::set_queue_depth(0);
    }

    /// Stop retries and listeners. A pass already running finishes but
    /// schedules nothing further.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.tasks.lock().abort_all();
        debug!("Retry queue destroyed");
    }
}

impl Drop for PersistentRetryQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Shared {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn priority_of(&self, item: &QueueItem) -> u8 {
        self.config.priorities.priority_of(&item.event.name)
    }

    fn is_high_priority(&self, item: &QueueItem) -> bool {
        self.config.high_priority_events.contains(&item.event.name)
    }

    /// Failed items go first, then lowest priority, then oldest.
    fn eviction_candidate(&self, items: &[QueueItem]) -> Option<usize> {
        items
            .iter()
            .enumerate()
            .filter(|(_, item)| !self.is_high_priority(item))
            .min_by_key(|(_, item)| (!item.failed, self.priority_of(item), item.enqueued_at))
            .map(|(idx, _)| idx)
    }

    async fn persist(&self, items: &[QueueItem]) {
        metrics::set_queue_depth(items.len());
        let value = match serde_json::to_value(items) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Cannot serialize retry queue");
                return;
            }
        };
        let report = self.storage.set(&self.config.storage_key, &value).await;
        if !report.any_accepted() {
            debug!(items = items.len(), "No storage tier accepted the queue, memory-only");
        }
    }

    /// Start a pass in the background unless one is running.
    fn kick(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.run_pass().await;
        });
    }

    async fn run_pass(self: &Arc<Self>) -> SyncReport {
        let mut report = SyncReport::default();
        {
            let mut state = self.state.lock().await;
            if state.processing {
                state.rerun = true;
                report.skipped = true;
                return report;
            }
            state.processing = true;
        }

        let mut attempted: HashSet<String> = HashSet::new();
        let mut failed_attempts: Vec<u32> = Vec::new();
        loop {
            self.drain(&mut attempted, &mut report, &mut failed_attempts).await;

            let mut state = self.state.lock().await;
            let again = std::mem::take(&mut state.rerun) && !self.is_destroyed() && self.signals.is_online();
            if !again {
                state.processing = false;
                break;
            }
            debug!("Items arrived mid-pass, going round again");
        }

        metrics::record_sync_pass(report.delivered, report.failed);
        if report.delivered > 0 || report.failed > 0 || report.exhausted > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                exhausted = report.exhausted,
                "Sync pass complete"
            );
        }

        if let Some(delay) = self.schedule.delay_for_all(failed_attempts) {
            self.schedule_retry(delay);
        }
        report
    }

    /// One sweep over pending items not yet tried in this pass.
    async fn drain(
        self: &Arc<Self>,
        attempted: &mut HashSet<String>,
        report: &mut SyncReport,
        failed_attempts: &mut Vec<u32>,
    ) {
        let order: Vec<String> = {
            let state = self.state.lock().await;
            let mut pending: Vec<&QueueItem> = state
                .items
                .iter()
                .filter(|i| !i.failed && !attempted.contains(&i.id))
                .collect();
            pending.sort_by_key(|i| {
                (Reverse(self.is_high_priority(i)), Reverse(self.priority_of(i)), i.enqueued_at)
            });
            pending.into_iter().map(|i| i.id.clone()).collect()
        };

        for id in order {
            attempted.insert(id.clone());
            let event = {
                let mut state = self.state.lock().await;
                let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
                    continue;
                };
                if item.attempts >= self.config.max_retries {
                    item.failed = true;
                    warn!(id = %id, attempts = item.attempts, "Retries exhausted, marking failed");
                    metrics::record_item_exhausted();
                    report.exhausted += 1;
                    self.persist(&state.items).await;
                    continue;
                }
                item.event.clone()
            };

            let result = {
                let _timer = metrics::LatencyTimer::new("queue", "on_sync");
                self.sink.on_sync(vec![event]).await
            };

            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    state.items.retain(|i| i.id != id);
                    metrics::record_sync_attempt("success");
                    report.delivered += 1;
                }
                Err(e) => {
                    metrics::record_sync_attempt("error");
                    report.failed += 1;
                    if let Some(item) = state.items.iter_mut().find(|i| i.id == id) {
                        item.attempts = (item.attempts + 1).min(self.config.max_retries);
                        item.last_attempt_at = Some(now_millis());
                        failed_attempts.push(item.attempts);
                        debug!(id = %id, attempts = item.attempts, error = %e, "Sync attempt failed");
                    }
                }
            }
            self.persist(&state.items).await;
            drop(state);

            if !self.signals.is_online() {
                debug!("Went offline mid-pass, stopping");
                break;
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        if self.is_destroyed() {
            return;
        }
        let weak = Arc::downgrade(self);
        debug!(?delay, "Next sync pass scheduled");
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.is_destroyed() || !shared.signals.is_online() {
                return;
            }
            // Own task: destroy() aborts this one, never a pass mid-send
            let pass = tokio::spawn(async move {
                shared.run_pass().await;
            });
            if let Err(e) = pass.await {
                if e.is_panic() {
                    warn!(error = %e, "Sync pass panicked");
                }
            }
        });
        if let Some(previous) = self.tasks.lock().retry.replace(task) {
            previous.abort();
        }
    }
}

async fn load_items(storage: &StorageManager, config: &QueueConfig) -> (Vec<QueueItem>, usize) {
    let Some(value) = storage.get(&config.storage_key).await else {
        return (Vec::new(), 0);
    };
    let Value::Array(raw) = value else {
        warn!("Persisted queue is not an array, starting empty");
        return (Vec::new(), 0);
    };

    let now = now_millis();
    let mut items = Vec::with_capacity(raw.len());
    let mut purged = 0;
    for entry in raw {
        match serde_json::from_value::<QueueItem>(entry) {
            Ok(item) if item.is_stale(now, config.stale_after_ms) => purged += 1,
            Ok(item) if item.event.is_valid() => items.push(item),
            Ok(item) => warn!(id = %item.id, "Dropping persisted item with invalid event"),
            Err(e) => warn!(error = %e, "Dropping undecodable persisted item"),
        }
    }
    (items, purged)
}

async fn watch_online(handle: Weak<Shared>, mut online: watch::Receiver<bool>) {
    let mut was_online = *online.borrow_and_update();
    while online.changed().await.is_ok() {
        let now_online = *online.borrow_and_update();
        let came_back = now_online && !was_online;
        was_online = now_online;
        if !came_back {
            continue;
        }
        let Some(shared) = handle.upgrade() else { break };
        info!("Connectivity restored, syncing retry queue");
        shared.kick();
    }
}

async fn watch_visibility(handle: Weak<Shared>, mut visibility: watch::Receiver<Visibility>) {
    let mut was_visible = *visibility.borrow_and_update() == Visibility::Visible;
    while visibility.changed().await.is_ok() {
        let now_visible = *visibility.borrow_and_update() == Visibility::Visible;
        let came_back = now_visible && !was_visible;
        was_visible = now_visible;
        if !came_back {
            continue;
        }
        let Some(shared) = handle.upgrade() else { break };
        if shared.signals.is_online() {
            debug!("Context visible again, syncing retry queue");
            shared.kick();
        }
    }
}

async fn watch_wake(handle: Weak<Shared>, mut wake: watch::Receiver<u64>) {
    while wake.changed().await.is_ok() {
        wake.borrow_and_update();
        let Some(shared) = handle.upgrade() else { break };
        if shared.signals.is_online() {
            debug!("Wake-up received, syncing retry queue");
            shared.kick();
        }
    }
}

async fn run_background(handle: Weak<Shared>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = handle.upgrade() else { break };
        if shared.is_destroyed() {
            break;
        }
        if shared.signals.is_online() {
            debug!("Background sync");
            shared.kick();
        }
    }
}
