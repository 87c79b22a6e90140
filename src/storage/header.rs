// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Size-capped text tier that rides along on outgoing requests.
//!
//! Values are held as UTF-8 text and can be rendered as a single
//! `Cookie`-style header value with [`HeaderTier::header_value`]. Anything
//! larger than `max_bytes` is refused; the manager shrinks oversized values
//! before they get here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{StorageError, StorageTier, TierKind};

pub struct HeaderTier {
    max_bytes: usize,
    values: RwLock<BTreeMap<String, String>>,
}

impl HeaderTier {
    /// Per-value limit most user agents enforce
    pub const DEFAULT_MAX_BYTES: usize = 4096;

    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Render every entry as `key=hexvalue; key2=hexvalue2`.
    ///
    /// Values are hex encoded so JSON punctuation never breaks header syntax.
    #[must_use]
    pub fn header_value(&self) -> String {
        self.values
            .read()
            .iter()
            .map(|(k, v)| format!("{}={}", k, hex::encode(v.as_bytes())))
            .collect::<Vec<_>>()
            .join("; ")
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl Default for HeaderTier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_BYTES)
    }
}

#[async_trait]
impl StorageTier for HeaderTier {
    fn kind(&self) -> TierKind {
        TierKind::Header
    }

    fn text_only(&self) -> bool {
        true
    }

    fn max_value_bytes(&self) -> Option<usize> {
        Some(self.max_bytes)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.values.read().get(key).map(|v| v.as_bytes().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if value.len() > self.max_bytes {
            return Err(StorageError::TooLarge {
                size: value.len(),
                max: self.max_bytes,
            });
        }
        let text = std::str::from_utf8(value)
            .map_err(|e| StorageError::Backend(format!("header tier needs text: {}", e)))?;
        self.values.write().insert(key.to_string(), text.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().remove(key);
        Ok(())
    }
}
