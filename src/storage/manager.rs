// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-tier storage with write-to-all redundancy.
//!
//! ```text
//!            set(key, value)                       get(key)
//!                  │                                   │
//!      ┌───────────┼───────────┬──────────┐            ▼
//!      ▼           ▼           ▼          ▼      first hit wins
//!   Local      Session    Structured   Header    Local → Session →
//!  (quota)     (context)   (SQLite)    (≈4 KB)   Structured → Header
//!      │
//!      └── quota failure: evict oldest 20 %, retry once
//!
//!   + ChangeNotice on the ChannelHub for other contexts
//! ```
//!
//! Tiers are probed once by [`StorageManager::probe`] from a list of
//! [`TierFactory`] variants. A factory that fails to produce a tier is
//! skipped; if all fail the manager has no tiers and every write reports
//! failure, which callers treat as memory-only operation.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{ChangeNotice, ChannelHub};
use super::codec::{self, StorageRecord};
use super::header::HeaderTier;
use super::local::LocalTier;
use super::session::SessionTier;
use super::structured::StructuredTier;
use super::traits::{StorageError, StorageTier, TierKind};
use crate::config::StorageConfig;

/// Fraction of entries dropped from a quota-bound tier before the single retry
const QUOTA_EVICT_FRACTION: f64 = 0.2;

/// Keys kept when a value must be shrunk to fit a capped tier
const IDENTITY_FIELDS: &[&str] = &["id", "name", "event", "enqueuedAt", "attempts", "failed", "timestamp"];

/// How to obtain one storage tier.
pub enum TierFactory {
    Local { quota_bytes: usize },
    Session,
    Structured { url: String },
    Header { max_bytes: usize },
    /// An already-built tier, typically shared with an earlier manager
    Shared(Arc<dyn StorageTier>),
}

impl TierFactory {
    async fn probe(self) -> Result<Arc<dyn StorageTier>, StorageError> {
        Ok(match self {
            Self::Local { quota_bytes } => Arc::new(LocalTier::new(quota_bytes)),
            Self::Session => Arc::new(SessionTier::new()),
            Self::Structured { url } => Arc::new(StructuredTier::connect(&url).await?),
            Self::Header { max_bytes } => Arc::new(HeaderTier::new(max_bytes)),
            Self::Shared(tier) => tier,
        })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Session => "session",
            Self::Structured { .. } => "structured",
            Self::Header { .. } => "header",
            Self::Shared(_) => "shared",
        }
    }
}

/// Per-tier outcome of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierWriteReport {
    pub results: Vec<(TierKind, bool)>,
}

impl TierWriteReport {
    /// A write counts as durable if any tier took it.
    #[must_use]
    pub fn any_accepted(&self) -> bool {
        self.results.iter().any(|(_, ok)| *ok)
    }

    #[must_use]
    pub fn accepted(&self, kind: TierKind) -> bool {
        self.results.iter().any(|(k, ok)| *k == kind && *ok)
    }
}

/// Handle for a [`StorageManager::subscribe`] listener. Dropping it detaches.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

pub struct StorageManager {
    tiers: Vec<Arc<dyn StorageTier>>,
    hub: Option<ChannelHub>,
    context_id: Uuid,
    compress_threshold: Option<usize>,
}

impl StorageManager {
    /// Probe every factory once and fix the tier order by read priority.
    pub async fn probe(
        factories: Vec<TierFactory>,
        hub: Option<ChannelHub>,
        compress_threshold: Option<usize>,
    ) -> Self {
        let mut tiers: Vec<Arc<dyn StorageTier>> = Vec::with_capacity(factories.len());
        for factory in factories {
            let label = factory.label();
            match factory.probe().await {
                Ok(tier) => {
                    debug!(tier = %tier.kind(), "Storage tier available");
                    crate::metrics::record_tier_probe(tier.kind().as_str(), true);
                    tiers.push(tier);
                }
                Err(e) => {
                    warn!(tier = label, error = %e, "Storage tier unavailable, skipping");
                    crate::metrics::record_tier_probe(label, false);
                }
            }
        }
        tiers.sort_by_key(|t| t.kind());

        if tiers.is_empty() {
            warn!("No storage tiers available, operating memory-only");
        } else {
            info!(tiers = ?tiers.iter().map(|t| t.kind()).collect::<Vec<_>>(), "Storage manager ready");
        }

        Self {
            tiers,
            hub,
            context_id: Uuid::new_v4(),
            compress_threshold,
        }
    }

    /// Build the factory list described by `config` and probe it.
    pub async fn from_config(config: &StorageConfig, hub: Option<ChannelHub>) -> Self {
        let mut factories = Vec::new();
        if config.local_enabled {
            factories.push(TierFactory::Local {
                quota_bytes: config.local_quota_bytes,
            });
        }
        if config.session_enabled {
            factories.push(TierFactory::Session);
        }
        if let Some(ref url) = config.structured_url {
            factories.push(TierFactory::Structured { url: url.clone() });
        }
        if config.header_enabled {
            factories.push(TierFactory::Header {
                max_bytes: config.header_max_bytes,
            });
        }
        let threshold = config.compression_enabled.then_some(config.compress_threshold_bytes);
        Self::probe(factories, hub, threshold).await
    }

    /// A manager with no tiers at all.
    #[must_use]
    pub fn memory_only() -> Self {
        Self {
            tiers: Vec::new(),
            hub: None,
            context_id: Uuid::new_v4(),
            compress_threshold: None,
        }
    }

    #[must_use]
    pub fn tiers(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind()).collect()
    }

    #[must_use]
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    /// Write `value` to every tier. Never fails as a whole.
    pub async fn set(&self, key: &str, value: &Value) -> TierWriteReport {
        let record = StorageRecord::new(value.clone());
        let mut report = TierWriteReport::default();

        let raw = match codec::encode_raw(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Cannot encode storage record");
                report.results = self.tiers.iter().map(|t| (t.kind(), false)).collect();
                return report;
            }
        };
        let packed = codec::encode(&record, self.compress_threshold).unwrap_or_else(|_| raw.clone());

        for tier in &self.tiers {
            let kind = tier.kind();
            let base = if tier.text_only() { &raw } else { &packed };

            let shrunk;
            let bytes = match tier.max_value_bytes() {
                Some(max) if base.len() > max => match shrink_to_fit(&record, max) {
                    Some(b) => {
                        debug!(key, tier = %kind, from = base.len(), to = b.len(), "Value shrunk to identity fields");
                        shrunk = b;
                        &shrunk
                    }
                    None => {
                        debug!(key, tier = %kind, size = base.len(), max, "Value cannot fit capped tier");
                        report.results.push((kind, false));
                        continue;
                    }
                },
                _ => base,
            };

            let ok = self.put_with_quota_retry(tier.as_ref(), key, bytes).await;
            crate::metrics::record_tier_write(kind.as_str(), ok);
            report.results.push((kind, ok));
        }

        self.publish(key, Some(value.clone()));
        report
    }

    async fn put_with_quota_retry(&self, tier: &dyn StorageTier, key: &str, bytes: &[u8]) -> bool {
        match tier.put(key, bytes).await {
            Ok(()) => true,
            Err(StorageError::QuotaExceeded { needed, available }) => {
                let evicted = tier.evict_oldest(QUOTA_EVICT_FRACTION);
                crate::metrics::record_quota_eviction(tier.kind().as_str(), evicted);
                warn!(key, tier = %tier.kind(), needed, available, evicted, "Quota exceeded, evicted oldest entries");
                match tier.put(key, bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key, tier = %tier.kind(), error = %e, "Write failed after eviction");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(key, tier = %tier.kind(), error = %e, "Tier write failed");
                false
            }
        }
    }

    /// Read tiers in priority order, returning the first decodable hit.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_record(key).await.map(|r| r.value)
    }

    pub async fn get_record(&self, key: &str) -> Option<StorageRecord> {
        for tier in &self.tiers {
            match tier.get(key).await {
                Ok(Some(bytes)) => match codec::decode(&bytes) {
                    Ok(record) => {
                        crate::metrics::record_tier_read(tier.kind().as_str(), true);
                        return Some(record);
                    }
                    Err(e) => {
                        warn!(key, tier = %tier.kind(), error = %e, "Undecodable value, trying next tier");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(key, tier = %tier.kind(), error = %e, "Tier read failed, trying next tier");
                }
            }
        }
        crate::metrics::record_tier_read("none", false);
        None
    }

    pub async fn has(&self, key: &str) -> bool {
        self.get_record(key).await.is_some()
    }

    pub async fn remove(&self, key: &str) {
        for tier in &self.tiers {
            if let Err(e) = tier.delete(key).await {
                warn!(key, tier = %tier.kind(), error = %e, "Tier delete failed");
            }
        }
        self.publish(key, None);
    }

    /// Observe changes to `key` made by *other* contexts on the shared hub.
    ///
    /// Writes made through this manager are not echoed back. Must be called
    /// inside a tokio runtime.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        let Some(ref hub) = self.hub else {
            return Subscription { task: None };
        };
        let mut rx = hub.receiver();
        let own = self.context_id;
        let key = key.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notice) if notice.origin != own && notice.key == key => callback(notice.value),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "Change subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }

    fn publish(&self, key: &str, value: Option<Value>) {
        if let Some(ref hub) = self.hub {
            hub.publish(ChangeNotice {
                origin: self.context_id,
                key: key.to_string(),
                value,
            });
        }
    }
}

/// Reduce a record to identity fields, dropping trailing array elements
/// until its raw encoding fits in `max` bytes.
fn shrink_to_fit(record: &StorageRecord, max: usize) -> Option<Vec<u8>> {
    let mut value = identity_subset(&record.value);
    loop {
        let candidate = StorageRecord {
            value,
            written_at: record.written_at,
        };
        let bytes = codec::encode_raw(&candidate).ok()?;
        if bytes.len() <= max {
            return Some(bytes);
        }
        value = candidate.value;
        match value {
            Value::Array(ref mut items) if !items.is_empty() => {
                items.pop();
            }
            _ => return None,
        }
    }
}

fn identity_subset(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| IDENTITY_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), identity_subset(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(identity_subset).collect()),
        other => other.clone(),
    }
}
