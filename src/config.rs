//! Configuration for the relay pipeline.
//!
//! # Example
//!
//! ```
//! use telemetry_relay::RelayConfig;
//!
//! // Minimal config (uses defaults)
//! let config = RelayConfig::default();
//! assert_eq!(config.dedup.max_cache_size, 1000);
//! assert_eq!(config.batch.priority_threshold, 70);
//!
//! // Partial config from JSON; everything omitted falls back to defaults
//! let config: RelayConfig = serde_json::from_str(r#"{
//!     "batch": { "max_batch_size": 20 },
//!     "queue": { "max_retries": 3 },
//!     "storage": { "structured_url": "sqlite::memory:" }
//! }"#).unwrap();
//! assert_eq!(config.batch.max_batch_size, 20);
//! assert_eq!(config.batch.max_batch_bytes, 64 * 1024);
//! assert_eq!(config.queue.max_retries, 3);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::priority::{HighPrioritySet, PriorityTable};

/// Top-level configuration. Every section and field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Deduplication cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Entries kept in both the identity and fingerprint caches
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Dotted paths hashed into the fingerprint, in order. Leave out fields
    /// the pipeline fills in (`id`, `timestamp`) or every event is unique.
    #[serde(default = "default_fingerprint_fields")]
    pub fingerprint_fields: Vec<String>,
}

fn default_max_cache_size() -> usize { 1000 }
fn default_fingerprint_fields() -> Vec<String> {
    ["name", "data.url", "data.transaction_id", "data.value"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_cache_size: default_max_cache_size(),
            fingerprint_fields: default_fingerprint_fields(),
        }
    }
}

/// Smart batching settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Events per batch on a fast connection
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Serialized bytes per batch
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Events at or above this priority skip batching
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: u8,

    /// Starting flush timer interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_min_flush_interval_ms")]
    pub min_flush_interval_ms: u64,
    #[serde(default = "default_max_flush_interval_ms")]
    pub max_flush_interval_ms: u64,

    /// Delay before re-flushing a batch the sink rejected
    #[serde(default = "default_retry_flush_delay_ms")]
    pub retry_flush_delay_ms: u64,

    #[serde(default)]
    pub priorities: PriorityTable,
}

fn default_max_batch_size() -> usize { 50 }
fn default_max_batch_bytes() -> usize { 64 * 1024 }
fn default_priority_threshold() -> u8 { 70 }
fn default_flush_interval_ms() -> u64 { 5_000 }
fn default_min_flush_interval_ms() -> u64 { 1_000 }
fn default_max_flush_interval_ms() -> u64 { 30_000 }
fn default_retry_flush_delay_ms() -> u64 { 5_000 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            priority_threshold: default_priority_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            min_flush_interval_ms: default_min_flush_interval_ms(),
            max_flush_interval_ms: default_max_flush_interval_ms(),
            retry_flush_delay_ms: default_retry_flush_delay_ms(),
            priorities: PriorityTable::default(),
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }

    #[must_use]
    pub fn max_flush_interval(&self) -> Duration {
        Duration::from_millis(self.max_flush_interval_ms.max(self.min_flush_interval_ms))
    }

    #[must_use]
    pub fn retry_flush_delay(&self) -> Duration {
        Duration::from_millis(self.retry_flush_delay_ms)
    }
}

/// Persistent retry queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Storage key the queue is persisted under
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Attempts before an item is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff table indexed by attempt count
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,

    /// Failed items older than this are purged at load
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Periodic background sync; off unless the host grants it
    #[serde(default)]
    pub background_sync: bool,

    /// Clamped to at least 15 minutes
    #[serde(default = "default_background_sync_interval_ms")]
    pub background_sync_interval_ms: u64,

    /// Never evicted to make room
    #[serde(default)]
    pub high_priority_events: HighPrioritySet,

    /// Drain order
    #[serde(default)]
    pub priorities: PriorityTable,
}

/// Floor for the background sync interval
pub const MIN_BACKGROUND_SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

fn default_storage_key() -> String { "telemetry_relay_queue".to_string() }
fn default_max_queue_size() -> usize { 100 }
fn default_max_retries() -> u32 { 5 }
fn default_retry_delays_ms() -> Vec<u64> { vec![1_000, 5_000, 15_000, 60_000] }
fn default_stale_after_ms() -> u64 { 24 * 60 * 60 * 1000 } // 24 hours
fn default_background_sync_interval_ms() -> u64 { 15 * 60 * 1000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_delays_ms: default_retry_delays_ms(),
            stale_after_ms: default_stale_after_ms(),
            background_sync: false,
            background_sync_interval_ms: default_background_sync_interval_ms(),
            high_priority_events: HighPrioritySet::default(),
            priorities: PriorityTable::default(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn background_sync_interval(&self) -> Duration {
        Duration::from_millis(self.background_sync_interval_ms).max(MIN_BACKGROUND_SYNC_INTERVAL)
    }
}

/// Storage tier selection.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub local_enabled: bool,
    #[serde(default = "default_local_quota_bytes")]
    pub local_quota_bytes: usize,

    #[serde(default = "default_true")]
    pub session_enabled: bool,

    /// SQLite URL (e.g. "sqlite://relay.db?mode=rwc"); structured tier off when unset
    #[serde(default)]
    pub structured_url: Option<String>,

    #[serde(default = "default_true")]
    pub header_enabled: bool,
    #[serde(default = "default_header_max_bytes")]
    pub header_max_bytes: usize,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    /// Records at least this large are compressed
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: usize,

    /// Buffered notices per subscriber on the cross-context channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_true() -> bool { true }
fn default_local_quota_bytes() -> usize { 5 * 1024 * 1024 } // 5 MB
fn default_header_max_bytes() -> usize { 4096 }
fn default_compress_threshold_bytes() -> usize { 1024 }
fn default_channel_capacity() -> usize { 256 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_enabled: true,
            local_quota_bytes: default_local_quota_bytes(),
            session_enabled: true,
            structured_url: None,
            header_enabled: true,
            header_max_bytes: default_header_max_bytes(),
            compression_enabled: true,
            compress_threshold_bytes: default_compress_threshold_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}
