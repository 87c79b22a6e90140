// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event-name priority tables.
//!
//! Batching and queue eviction each get their own table through config;
//! nothing forces the two to agree.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Highest priority an event can carry
pub const MAX_PRIORITY: u8 = 100;

/// Name → priority (0–100). Unknown names get `default_priority`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTable {
    #[serde(default)]
    pub priorities: HashMap<String, u8>,
    #[serde(default)]
    pub default_priority: u8,
}

impl PriorityTable {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            priorities: HashMap::new(),
            default_priority: 0,
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, priority: u8) -> Self {
        self.priorities.insert(name.into(), priority.min(MAX_PRIORITY));
        self
    }

    #[must_use]
    pub fn priority_of(&self, name: &str) -> u8 {
        self.priorities
            .get(name)
            .copied()
            .unwrap_or(self.default_priority)
            .min(MAX_PRIORITY)
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::empty()
            .with("purchase", 100)
            .with("checkout", 90)
            .with("sign_up", 80)
            .with("add_to_cart", 75)
            .with("lead", 70)
            .with("form_submit", 60)
            .with("click", 30)
            .with("page_view", 20)
            .with("scroll", 10)
    }
}

/// Event names exempt from queue eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HighPrioritySet(HashSet<String>);

impl HighPrioritySet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for HighPrioritySet {
    fn default() -> Self {
        Self::new(["purchase", "checkout", "sign_up", "lead"])
    }
}
