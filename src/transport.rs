// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The delivery seam: where events leave the relay.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The collector answered and refused the payload
    #[error("collector rejected batch: {0}")]
    Rejected(String),

    /// The collector could not be reached
    #[error("collector unavailable: {0}")]
    Unavailable(String),

    #[error("delivery timed out")]
    Timeout,
}

/// Sends events to the remote collector. Owns its own timeouts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, events: &[Event]) -> Result<(), TransportError>;

    /// Fire-and-forget send that survives the context being torn down.
    /// Returns `true` if the payload was handed off.
    async fn beacon(&self, _events: &[Event]) -> bool {
        false
    }
}
