// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage tiers and the manager that replicates across them.

pub mod channel;
pub mod codec;
pub mod header;
pub mod local;
pub mod manager;
pub mod session;
pub mod structured;
pub mod traits;

pub use channel::{ChangeNotice, ChannelHub};
pub use codec::{CompressionError, StorageRecord};
pub use manager::{StorageManager, Subscription, TierFactory, TierWriteReport};
pub use traits::{StorageError, StorageTier, TierKind};
