// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Quota-bound synchronous tier.
//!
//! Outlives a single pipeline instance: hand the same `Arc<LocalTier>` to a
//! fresh [`StorageManager`](super::StorageManager) to rehydrate after a
//! restart. Writes that would push the total past `quota_bytes` fail with
//! [`StorageError::QuotaExceeded`]; the manager then calls
//! [`evict_oldest`](StorageTier::evict_oldest) and retries once.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{StorageError, StorageTier, TierKind};

struct Entry {
    bytes: Vec<u8>,
    /// Write order; ties on wall-clock time are common so a counter is used
    seq: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    used_bytes: usize,
    next_seq: u64,
}

pub struct LocalTier {
    quota_bytes: usize,
    state: Mutex<State>,
}

impl LocalTier {
    /// Default quota, roughly what browsers grant per origin
    pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

    #[must_use]
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            quota_bytes,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn footprint(key: &str, value: &[u8]) -> usize {
        key.len() + value.len()
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUOTA_BYTES)
    }
}

#[async_trait]
impl StorageTier for LocalTier {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state.lock().entries.get(key).map(|e| e.bytes.clone()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let existing = state
            .entries
            .get(key)
            .map_or(0, |e| Self::footprint(key, &e.bytes));
        let needed = Self::footprint(key, value);
        let available = self.quota_bytes.saturating_sub(state.used_bytes - existing);
        if needed > available {
            return Err(StorageError::QuotaExceeded { needed, available });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.used_bytes = state.used_bytes - existing + needed;
        state.entries.insert(
            key.to_string(),
            Entry {
                bytes: value.to_vec(),
                seq,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if let Some(e) = state.entries.remove(key) {
            state.used_bytes -= Self::footprint(key, &e.bytes);
        }
        Ok(())
    }

    fn evict_oldest(&self, fraction: f64) -> usize {
        let mut state = self.state.lock();
        let total = state.entries.len();
        if total == 0 {
            return 0;
        }
        let count = ((total as f64 * fraction).ceil() as usize).clamp(1, total);

        let mut by_age: Vec<(u64, String)> = state
            .entries
            .iter()
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(count) {
            if let Some(e) = state.entries.remove(&key) {
                state.used_bytes -= Self::footprint(&key, &e.bytes);
            }
        }
        count
    }
}
