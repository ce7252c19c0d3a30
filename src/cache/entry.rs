//! Cache entry and diagnostic types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One cached value with its write timestamp and time-to-live.
///
/// Entries are immutable once written: a new `set` for the same key replaces
/// the entry wholesale, it never mutates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  /// Opaque payload. Business shapes never leak into the cache.
  pub value: Value,
  pub written_at: DateTime<Utc>,
  pub ttl_ms: i64,
}

impl CacheEntry {
  pub fn new(key: String, value: Value, written_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      key,
      value,
      written_at,
      ttl_ms: ttl.num_milliseconds(),
    }
  }

  /// An entry is fresh iff `now - written_at < ttl`.
  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    now - self.written_at < Duration::milliseconds(self.ttl_ms)
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.written_at
  }

  /// Remaining lifetime. Negative once the entry has expired.
  pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
    Duration::milliseconds(self.ttl_ms) - self.age(now)
  }
}

/// Diagnostic snapshot of the store. Computing it evicts nothing.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
  /// Entries still within their TTL.
  pub valid_count: usize,
  /// Entries past their TTL but not yet evicted by a `get`/`set`.
  pub expired_count: usize,
  /// Serialized size of the full snapshot.
  pub approx_byte_size: usize,
  /// Age in milliseconds of every resident entry.
  pub per_key_age: HashMap<String, i64>,
}
