// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ephemeral cross-context change channel.
//!
//! A [`ChannelHub`] is shared by every [`StorageManager`](super::StorageManager)
//! that should see each other's writes. Nothing is stored here: a notice is
//! delivered to whoever is subscribed at the time and then forgotten.

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A change broadcast by one context.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Context that made the change
    pub origin: Uuid,
    pub key: String,
    /// New value, `None` on removal
    pub value: Option<Value>,
}

#[derive(Clone)]
pub struct ChannelHub {
    tx: broadcast::Sender<ChangeNotice>,
}

impl ChannelHub {
    const DEFAULT_CAPACITY: usize = 256;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a change. Returns how many receivers saw it.
    pub fn publish(&self, notice: ChangeNotice) -> usize {
        // No receivers is not an error for a fire-and-forget channel
        self.tx.send(notice).unwrap_or(0)
    }

    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<ChangeNotice> {
        self.tx.subscribe()
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let hub = ChannelHub::new();
        let n = hub.publish(ChangeNotice {
            origin: Uuid::new_v4(),
            key: "k".into(),
            value: None,
        });
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_receivers_see_notices() {
        let hub = ChannelHub::new();
        let mut rx = hub.receiver();
        let origin = Uuid::new_v4();
        hub.publish(ChangeNotice {
            origin,
            key: "k".into(),
            value: Some(json!(1)),
        });
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.origin, origin);
        assert_eq!(notice.value, Some(json!(1)));
    }
}
