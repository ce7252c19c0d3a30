//! Render-stable subscription to a single cache key.
//!
//! A `CacheSubscription` gives one consumer a live view of one key. The view it
//! hands out is memoized on the entry's write timestamp and TTL: as long as the
//! underlying entry has not changed, `view()` returns the *same* `Arc`, so
//! consumers can key change detection on pointer identity. This is a
//! correctness requirement, not an optimization; identity-churning views have a
//! history of sending renderers into re-subscribe loops.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::store::{ChangeSubscriptionId, PersistentStore};

/// Immutable snapshot of one cache key, with derived freshness accessors.
///
/// `is_fresh` and `time_until_expiry` are both computed from the same
/// `written_at`/`ttl_ms` pair, so they can never disagree about which write
/// they describe.
#[derive(Debug)]
pub struct CacheView {
  pub value: Option<Value>,
  pub written_at: Option<DateTime<Utc>>,
  pub ttl_ms: i64,
}

impl CacheView {
  fn empty() -> Self {
    Self {
      value: None,
      written_at: None,
      ttl_ms: 0,
    }
  }

  pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    match self.written_at {
      Some(written_at) => now - written_at < Duration::milliseconds(self.ttl_ms),
      None => false,
    }
  }

  pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
    self
      .written_at
      .map(|written_at| Duration::milliseconds(self.ttl_ms) - (now - written_at))
  }

  /// Deserialize the value. A payload that does not fit `T` reads as absent.
  pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
    self
      .value
      .clone()
      .and_then(|v| serde_json::from_value(v).ok())
  }
}

/// Live, render-stable binding of one cache key.
pub struct CacheSubscription {
  store: Arc<PersistentStore>,
  key: String,
  /// TTL applied by `set_cache` writes.
  write_ttl: Duration,
  view: Mutex<Arc<CacheView>>,
  changed: Arc<AtomicBool>,
  change_subscription: ChangeSubscriptionId,
}

impl CacheSubscription {
  pub fn new(store: Arc<PersistentStore>, key: &str, write_ttl: Duration) -> Self {
    let changed = Arc::new(AtomicBool::new(false));
    let changed_cb = Arc::clone(&changed);
    let change_subscription = store.subscribe_changes(key, move |_| {
      changed_cb.store(true, Ordering::SeqCst);
    });

    Self {
      store,
      key: key.to_string(),
      write_ttl,
      view: Mutex::new(Arc::new(CacheView::empty())),
      changed,
      change_subscription,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Current view of the key.
  ///
  /// Returns the previously handed-out `Arc` unchanged while the underlying
  /// `(written_at, ttl_ms)` pair is unchanged; a stale entry reads as empty
  /// (the store evicts it as a side effect).
  pub fn view(&self) -> Arc<CacheView> {
    let entry = self.store.entry(&self.key);

    let mut current = match self.view.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let unchanged = match &entry {
      Some(e) => current.written_at == Some(e.written_at) && current.ttl_ms == e.ttl_ms,
      None => current.written_at.is_none(),
    };
    if unchanged {
      return Arc::clone(&current);
    }

    let next = Arc::new(match entry {
      Some(e) => CacheView {
        value: Some(e.value),
        written_at: Some(e.written_at),
        ttl_ms: e.ttl_ms,
      },
      None => CacheView::empty(),
    });
    *current = Arc::clone(&next);
    next
  }

  /// Write through to the store and refresh the local view in the same call.
  pub fn set_cache<T: Serialize>(&self, value: &T) {
    self.store.set(&self.key, value, self.write_ttl);
    self.view();
  }

  /// Remove the entry and reset the local view to empty.
  pub fn clear_cache(&self) {
    self.store.clear(Some(&self.key));
    self.view();
  }

  /// True once since the last call if the underlying key changed. Poll this
  /// from a render/tick loop.
  pub fn take_changed(&self) -> bool {
    self.changed.swap(false, Ordering::SeqCst)
  }
}

impl Drop for CacheSubscription {
  fn drop(&mut self) {
    self.store.unsubscribe(self.change_subscription);
  }
}
