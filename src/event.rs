//! Event data structures.
//!
//! An [`Event`] is what producer code hands to the pipeline. Once inside it
//! is stamped with an id and timestamp ([`Event::stamp`]) before anything
//! asynchronous happens, so every later stage (dedup, batching, retry)
//! agrees on its identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A telemetry event.
///
/// # Example
///
/// ```
/// use telemetry_relay::Event;
/// use serde_json::json;
///
/// let mut event = Event::new("page_view", json!({"url": "/pricing"}));
/// assert!(event.id.is_none());
///
/// let id = event.stamp().to_string();
/// assert_eq!(event.id.as_deref(), Some(id.as_str()));
/// // Stamping again never mints a second id
/// assert_eq!(event.stamp(), id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Parse an event from arbitrary JSON. `None` if it isn't a valid event.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value::<Self>(value)
            .ok()
            .filter(Self::is_valid)
    }

    /// An event needs a non-blank name.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// Assign an id and timestamp if missing. Returns the (possibly existing) id.
    pub fn stamp(&mut self) -> &str {
        if self.timestamp.is_none() {
            self.timestamp = Some(now_millis());
        }
        self.id.get_or_insert_with(|| Uuid::new_v4().to_string())
    }

    /// Serialized size, used for batch byte limits.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |v| v.len())
    }
}

/// An event as it sits in a batch: the original fields plus batching metadata.
///
/// Serializes flat, e.g. `{"name": .., "data": .., "_id": .., "_enqueuedAt": .., "_priority": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub event: Event,
    #[serde(rename = "_id")]
    pub batch_id: String,
    #[serde(rename = "_enqueuedAt")]
    pub enqueued_at: i64,
    #[serde(rename = "_priority")]
    pub priority: u8,
}

impl EnrichedEvent {
    /// Wrap a stamped event. Unstamped events get stamped here.
    pub fn new(mut event: Event, priority: u8) -> Self {
        let batch_id = event.stamp().to_string();
        Self {
            event,
            batch_id,
            enqueued_at: now_millis(),
            priority,
        }
    }

    #[must_use]
    pub fn into_event(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stamp_is_idempotent() {
        let mut event = Event::new("click", json!({}));
        let first = event.stamp().to_string();
        let ts = event.timestamp;
        assert_eq!(event.stamp(), first);
        assert_eq!(event.timestamp, ts);
    }

    #[test]
    fn test_stamp_keeps_producer_id() {
        let mut event = Event::new("click", json!({})).with_id("abc").with_timestamp(7);
        assert_eq!(event.stamp(), "abc");
        assert_eq!(event.timestamp, Some(7));
    }

    #[test]
    fn test_validation() {
        assert!(Event::new("ok", Value::Null).is_valid());
        assert!(!Event::new("", Value::Null).is_valid());
        assert!(!Event::new("   ", Value::Null).is_valid());
    }

    #[test]
    fn test_from_value() {
        assert!(Event::from_value(json!({"name": "x"})).is_some());
        assert!(Event::from_value(json!({"data": {}})).is_none());
        assert!(Event::from_value(json!({"name": ""})).is_none());
        assert!(Event::from_value(json!("just a string")).is_none());

        let e = Event::from_value(json!({"name": "x", "id": "1", "timestamp": 5})).unwrap();
        assert_eq!(e.id.as_deref(), Some("1"));
        assert_eq!(e.data, Value::Null);
    }

    #[test]
    fn test_serialize_skips_missing_id() {
        let json_str = serde_json::to_string(&Event::new("x", json!(1))).unwrap();
        assert!(!json_str.contains("\"id\""));
        assert!(!json_str.contains("timestamp"));
    }

    #[test]
    fn test_enriched_serializes_flat() {
        let event = Event::new("purchase", json!({"value": 10})).with_id("evt-1");
        let enriched = EnrichedEvent::new(event, 100);
        let v = serde_json::to_value(&enriched).unwrap();

        assert_eq!(v["name"], "purchase");
        assert_eq!(v["id"], "evt-1");
        assert_eq!(v["_id"], "evt-1");
        assert_eq!(v["_priority"], 100);
        assert!(v["_enqueuedAt"].as_i64().unwrap() > 0);

        let back: EnrichedEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, enriched);
    }
}
