// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use super::codec::CompressionError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },
    #[error("Value too large for tier: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Codec error: {0}")]
    Codec(#[from] CompressionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage back-ends, in descending read priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierKind {
    /// Synchronous, context-persistent store with a byte quota
    Local,
    /// Synchronous store scoped to a single context
    Session,
    /// Asynchronous structured store (SQLite)
    Structured,
    /// Small text store shared with outgoing request headers
    Header,
}

impl TierKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Session => "session",
            Self::Structured => "structured",
            Self::Header => "header",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait StorageTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Tier only accepts UTF-8 text, so values are stored as raw JSON.
    fn text_only(&self) -> bool {
        false
    }

    /// Largest encoded value this tier accepts, if capped.
    fn max_value_bytes(&self) -> Option<usize> {
        None
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Drop the oldest `fraction` of entries by write time. Returns the number removed.
    ///
    /// Only quota-bound tiers need this; the default is a no-op.
    fn evict_oldest(&self, _fraction: f64) -> usize {
        0
    }
}
