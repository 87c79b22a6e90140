// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record encoding for storage tiers.
//!
//! Every value written through the [`StorageManager`](super::StorageManager)
//! is wrapped in a [`StorageRecord`] and prefixed with a one-byte format tag:
//!
//! | Tag   | Payload                          |
//! |-------|----------------------------------|
//! | `j`   | raw JSON                         |
//! | `z`   | zstd-compressed JSON             |
//!
//! Untagged bytes starting with `{` or `[` are decoded as legacy raw JSON, so
//! values written before the tag existed still load. Unknown tags are an error
//! rather than a guess.
//!
//! Compression requires the `compression` feature (on by default). Without it
//! the encoder always emits `j` and `z` payloads fail to decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag for raw JSON payloads
pub const TAG_RAW: u8 = b'j';

/// Tag for zstd-compressed JSON payloads
pub const TAG_ZSTD: u8 = b'z';

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Format tag not recognised
    #[error("unknown format tag: 0x{0:02x}")]
    UnknownTag(u8),

    /// Failed to parse JSON
    #[error("JSON parse failed: {0}")]
    JsonParseFailed(#[from] serde_json::Error),
}

/// A value as replicated across tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub value: Value,
    /// Epoch millis at write time
    #[serde(rename = "writtenAt")]
    pub written_at: i64,
}

impl StorageRecord {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            written_at: crate::event::now_millis(),
        }
    }
}

/// Encode a record as tagged raw JSON.
pub fn encode_raw(record: &StorageRecord) -> Result<Vec<u8>, CompressionError> {
    let json = serde_json::to_vec(record)?;
    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(TAG_RAW);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Encode a record, compressing when the JSON is at least `threshold` bytes.
///
/// `None` disables compression for this write.
pub fn encode(record: &StorageRecord, threshold: Option<usize>) -> Result<Vec<u8>, CompressionError> {
    let raw = encode_raw(record)?;
    match threshold {
        Some(t) if raw.len() > t => compress_tagged(&raw[1..]).map(|c| {
            // Keep the raw form if compression didn't pay off
            if c.len() < raw.len() { c } else { raw }
        }),
        _ => Ok(raw),
    }
}

#[cfg(feature = "compression")]
fn compress_tagged(json: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let compressed = zstd::encode_all(json, DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(TAG_ZSTD);
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[cfg(not(feature = "compression"))]
fn compress_tagged(json: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(json.len() + 1);
    out.push(TAG_RAW);
    out.extend_from_slice(json);
    Ok(out)
}

/// Check if data carries the compressed tag.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.first() == Some(&TAG_ZSTD)
}

/// Decode tagged (or legacy untagged) bytes into a record.
pub fn decode(data: &[u8]) -> Result<StorageRecord, CompressionError> {
    match data.first() {
        None => Err(CompressionError::DecompressFailed("empty payload".into())),
        Some(&TAG_RAW) => parse_record(&data[1..]),
        Some(&TAG_ZSTD) => parse_record(&decompress(&data[1..])?),
        Some(b'{') | Some(b'[') => parse_record(data),
        Some(&other) => Err(CompressionError::UnknownTag(other)),
    }
}

/// Legacy payloads may be a bare value rather than a record.
fn parse_record(json: &[u8]) -> Result<StorageRecord, CompressionError> {
    let value: Value = serde_json::from_slice(json)?;
    if value.get("writtenAt").is_some() && value.get("value").is_some() {
        return Ok(serde_json::from_value(value)?);
    }
    Ok(StorageRecord { value, written_at: 0 })
}

#[cfg(feature = "compression")]
fn decompress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

#[cfg(not(feature = "compression"))]
fn decompress(_data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Err(CompressionError::DecompressFailed(
        "compression feature disabled".into(),
    ))
}
