// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event deduplication.
//!
//! Two caches sit side by side:
//!
//! - an identity cache (event id → fingerprint), evicted in insertion order
//! - a fingerprint multiset counting how many cached identities share each
//!   fingerprint
//!
//! Evicting an identity releases its fingerprint in the same step, so the
//! multiset can never outgrow the identity cache.
//!
//! # Example
//!
//! ```
//! use telemetry_relay::{Deduplicator, Event};
//! use serde_json::json;
//!
//! let dedup = Deduplicator::new(100, vec!["name".into(), "data.url".into()]);
//! let a = Event::new("page_view", json!({"url": "/"})).with_id("a");
//! let b = Event::new("page_view", json!({"url": "/"})).with_id("b");
//!
//! assert!(!dedup.is_duplicate(&a));
//! dedup.mark_processed(&a);
//! assert!(dedup.is_duplicate(&a));
//! // Different id, same content
//! assert!(dedup.is_duplicate(&b));
//! ```

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::config::DedupConfig;
use crate::event::Event;

/// Which cache recognised a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOf {
    Id,
    Fingerprint,
}

impl DuplicateOf {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Fingerprint => "fingerprint",
        }
    }
}

#[derive(Default)]
struct DedupState {
    order: VecDeque<String>,
    identities: HashMap<String, String>,
    fingerprints: HashMap<String, usize>,
}

impl DedupState {
    fn lookup(&self, key: &str, fingerprint: &str) -> Option<DuplicateOf> {
        if self.identities.contains_key(key) {
            Some(DuplicateOf::Id)
        } else if self.fingerprints.contains_key(fingerprint) {
            Some(DuplicateOf::Fingerprint)
        } else {
            None
        }
    }

    fn insert(&mut self, key: String, fingerprint: String, max: usize) {
        if self.identities.contains_key(&key) {
            return;
        }
        *self.fingerprints.entry(fingerprint.clone()).or_insert(0) += 1;
        self.identities.insert(key.clone(), fingerprint);
        self.order.push_back(key);

        while self.order.len() > max {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(fp) = self.identities.remove(&oldest) {
                self.release(&fp);
            }
        }
    }

    fn release(&mut self, fingerprint: &str) {
        if let Some(count) = self.fingerprints.get_mut(fingerprint) {
            *count -= 1;
            if *count == 0 {
                self.fingerprints.remove(fingerprint);
            }
        }
    }
}

/// Bounded duplicate detector. One per pipeline.
pub struct Deduplicator {
    max_cache_size: usize,
    fields: Vec<String>,
    state: Mutex<DedupState>,
}

impl Deduplicator {
    pub fn new(max_cache_size: usize, fields: Vec<String>) -> Self {
        Self {
            max_cache_size: max_cache_size.max(1),
            fields,
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.max_cache_size, config.fingerprint_fields.clone())
    }

    /// Content hash over the configured fields: 8 lowercase hex digits.
    #[must_use]
    pub fn fingerprint(&self, event: &Event) -> String {
        let value = serde_json::to_value(event).unwrap_or(Value::Null);
        let joined = self
            .fields
            .iter()
            .filter_map(|path| lookup_path(&value, path))
            .collect::<Vec<_>>()
            .join("|");
        hex::encode(rolling_hash(&joined).to_be_bytes())
    }

    #[must_use]
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let fingerprint = self.fingerprint(event);
        let key = identity_key(event, &fingerprint);
        self.state.lock().lookup(key, &fingerprint).is_some()
    }

    /// Remember `event`. Marking the same identity twice is a no-op.
    pub fn mark_processed(&self, event: &Event) {
        let fingerprint = self.fingerprint(event);
        let key = identity_key(event, &fingerprint).to_string();
        let mut state = self.state.lock();
        state.insert(key, fingerprint, self.max_cache_size);
        crate::metrics::set_dedup_cache_entries(state.order.len());
    }

    /// Check and mark under one lock. Returns `true` if the event is new.
    pub fn admit(&self, event: &Event) -> bool {
        let fingerprint = self.fingerprint(event);
        let key = identity_key(event, &fingerprint).to_string();
        let mut state = self.state.lock();
        if let Some(matched) = state.lookup(&key, &fingerprint) {
            debug!(key = %key, fingerprint = %fingerprint, matched_on = matched.as_str(), "Duplicate event dropped");
            crate::metrics::record_duplicate(matched.as_str());
            return false;
        }
        state.insert(key, fingerprint, self.max_cache_size);
        crate::metrics::set_dedup_cache_entries(state.order.len());
        true
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.order.clear();
        state.identities.clear();
        state.fingerprints.clear();
        crate::metrics::set_dedup_cache_entries(0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn max_cache_size(&self) -> usize {
        self.max_cache_size
    }

    #[cfg(test)]
    fn fingerprint_entries(&self) -> usize {
        self.state.lock().fingerprints.values().sum()
    }
}

/// Events without an id are keyed by their fingerprint.
fn identity_key<'a>(event: &'a Event, fingerprint: &'a str) -> &'a str {
    event.id.as_deref().unwrap_or(fingerprint)
}

/// Resolve a dotted path, rendering the value as text. Missing, null and
/// empty-string values are skipped.
fn lookup_path(root: &Value, path: &str) -> Option<String> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// `h = h * 31 + unit` over UTF-16 code units, wrapping at 32 bits.
pub fn rolling_hash(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)))
}
