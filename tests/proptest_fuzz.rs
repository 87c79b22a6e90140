//! Property-based tests (fuzzing) for relay resilience.
//!
//! Uses proptest to generate random/malformed inputs and verify the relay
//! never panics, only returns clean errors or `None`.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};

use telemetry_relay::dedup::rolling_hash;
use telemetry_relay::storage::codec;
use telemetry_relay::batching::smart_batcher::{adapt_interval, scaled_batch_size};
use telemetry_relay::{Deduplicator, DedupConfig, Event, NetworkSpeed, QueueItem};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Events drawn from a small vocabulary so duplicates actually happen
fn event_strategy() -> impl Strategy<Value = Event> {
    (
        prop::sample::select(vec!["page_view", "click", "purchase", "scroll"]),
        prop::option::of("[a-c]{1,2}"),
        0i64..4,
        prop::option::of(0i64..5),
    )
        .prop_map(|(name, id, ts, value)| {
            let data = match value {
                Some(v) => json!({ "url": "/", "value": v }),
                None => json!({ "url": "/" }),
            };
            let mut event = Event::new(name, data).with_timestamp(ts);
            if let Some(id) = id {
                event = event.with_id(id);
            }
            event
        })
}

fn speed_strategy() -> impl Strategy<Value = NetworkSpeed> {
    prop::sample::select(vec![
        NetworkSpeed::Slow2g,
        NetworkSpeed::TwoG,
        NetworkSpeed::ThreeG,
        NetworkSpeed::FourG,
        NetworkSpeed::Unknown,
    ])
}

// =============================================================================
// Parsing Fuzz Tests
// =============================================================================

proptest! {
    /// Event parsing should never panic on arbitrary JSON
    #[test]
    fn fuzz_event_from_arbitrary_json(json in arbitrary_json_strategy()) {
        if let Some(event) = Event::from_value(json) {
            prop_assert!(event.is_valid());
        }
    }

    /// Record decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_codec_decode_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        let _ = codec::decode(&bytes);
    }

    /// A tagged record with flipped bytes fails cleanly or decodes to something
    #[test]
    fn fuzz_corrupted_record(
        value in arbitrary_json_strategy(),
        corruption in prop::collection::vec(any::<u8>(), 1..20),
        position in 0usize..10000,
    ) {
        let record = codec::StorageRecord::new(value);
        let mut bytes = codec::encode_raw(&record).unwrap();
        let pos = position % bytes.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % bytes.len();
            bytes[idx] ^= b;
        }
        let _ = codec::decode(&bytes);
    }

    /// Queue entries read back from storage tolerate any shape
    #[test]
    fn fuzz_queue_item_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<QueueItem>(json);
    }
}

// =============================================================================
// Fingerprint and Dedup Properties
// =============================================================================

proptest! {
    /// Fingerprints are always eight lowercase hex chars and deterministic
    #[test]
    fn prop_fingerprint_shape(event in event_strategy(), extra in arbitrary_json_strategy()) {
        let dedup = Deduplicator::from_config(&DedupConfig::default());
        let mut event = event;
        event.data = json!({ "url": "/", "extra": extra });

        let a = dedup.fingerprint(&event);
        let b = dedup.fingerprint(&event);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 8);
        prop_assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn prop_rolling_hash_deterministic(content in ".*") {
        prop_assert_eq!(rolling_hash(&content), rolling_hash(&content));
    }

    /// Cache never outgrows its bound, and anything just admitted is a duplicate
    #[test]
    fn prop_dedup_bounded(
        cap in 1usize..16,
        events in prop::collection::vec(event_strategy(), 0..200),
    ) {
        let dedup = Deduplicator::new(cap, DedupConfig::default().fingerprint_fields);
        for event in &events {
            if dedup.admit(event) {
                prop_assert!(dedup.is_duplicate(event));
            }
            prop_assert!(dedup.len() <= cap);
        }
    }
}

// =============================================================================
// Batching Arithmetic
// =============================================================================

proptest! {
    #[test]
    fn prop_scaled_batch_size_positive(max in 0usize..10_000, speed in speed_strategy()) {
        let size = scaled_batch_size(max, speed);
        prop_assert!(size >= 1);
        prop_assert!(size <= max.max(1));
    }

    /// Adapted interval never leaves [min, max] once it starts inside
    #[test]
    fn prop_adapt_interval_in_bounds(
        min_ms in 1u64..5_000,
        span_ms in 0u64..60_000,
        offset in 0u64..60_000,
        fills in prop::collection::vec(0.0f64..=1.0, 1..50),
    ) {
        let min = Duration::from_millis(min_ms);
        let max = Duration::from_millis(min_ms + span_ms);
        let mut current = Duration::from_millis(min_ms + offset % (span_ms + 1));
        for fill in fills {
            current = adapt_interval(current, fill, min, max);
            prop_assert!(current >= min && current <= max, "{:?} outside [{:?}, {:?}]", current, min, max);
        }
    }
}

// =============================================================================
// Edge Cases
// =============================================================================

proptest! {
    /// Blank names are never valid
    #[test]
    fn prop_blank_names_rejected(spaces in "[ \t\n]{0,10}", data in arbitrary_json_strategy()) {
        let value = json!({ "name": spaces, "data": data });
        prop_assert!(Event::from_value(value).is_none());
    }

    /// Stamping is idempotent for any pre-set id
    #[test]
    fn prop_stamp_keeps_existing_id(id in "[a-zA-Z0-9-]{1,36}") {
        let mut event = Event::new("click", Value::Null).with_id(id.clone());
        prop_assert_eq!(event.stamp(), id.as_str());
        prop_assert!(event.timestamp.is_some());
    }
}
