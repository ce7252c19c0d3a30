//! Client-side persistent cache.
//!
//! This module provides the caching half of the data synchronization layer:
//! - TTL'd entries persisted as a single snapshot in a durable medium
//! - Rehydration with prune-on-load at startup
//! - Graceful degradation when the medium is full or unavailable
//! - Render-stable per-key subscriptions for presentation code

mod entry;
mod medium;
mod store;
mod subscription;

pub use entry::{CacheEntry, CacheStats};
pub use medium::{DurableMedium, MemoryMedium, SqliteMedium};
pub use store::{ChangeSubscriptionId, PersistentStore, DEFAULT_EVICT_BATCH};
pub use subscription::{CacheSubscription, CacheView};
