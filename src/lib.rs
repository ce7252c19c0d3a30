//! Client-side data synchronization and caching for a trading-bot fleet
//! dashboard.
//!
//! The crate has three layers:
//! - [`cache`] — a TTL'd persistent store with graceful degradation and
//!   render-stable per-key subscriptions
//! - [`sync`] — request coordination: dedup, interval refresh, bounded retry,
//!   manual invalidation
//! - [`api`] — the fleet HTTP client and named resources
//!
//! Presentation code consumes `PersistentStore::{get,set,clear,stats}` and
//! per-resource subscriptions exposing `{data, error, is_loading, mutate}`.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod sync;
