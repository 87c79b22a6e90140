// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod smart_batcher;

pub use smart_batcher::{
    AddOptions, BatchError, BatchStats, FlushMeta, FlushReason, FlushSink, SmartBatcher,
};
