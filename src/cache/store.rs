//! Persistent key/value cache with per-entry TTL.
//!
//! The store owns an in-memory map of entries and mirrors it as a single
//! serialized snapshot in the durable medium. All medium failures are contained
//! here: on capacity pressure the store evicts its oldest entries and retries
//! once, and on any other failure it silently degrades to in-memory only.
//! Callers never see a storage error and `get` never fails.
//!
//! Exactly one store instance must own a given medium key. Construct it once at
//! startup and share it as `Arc<PersistentStore>`.

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StorageError;

use super::entry::{CacheEntry, CacheStats};
use super::medium::DurableMedium;

/// Medium key under which the full snapshot is persisted.
const SNAPSHOT_KEY: &str = "fleetdeck-cache";

/// Default number of oldest entries evicted when the medium reports capacity
/// exceeded.
pub const DEFAULT_EVICT_BATCH: usize = 5;

/// Handle returned by [`PersistentStore::subscribe_changes`].
pub type ChangeSubscriptionId = u64;

type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct StoreInner {
  entries: HashMap<String, CacheEntry>,
  subscribers: Vec<(ChangeSubscriptionId, String, ChangeCallback)>,
  next_subscription: ChangeSubscriptionId,
}

/// TTL'd key/value cache mirrored to a durable medium.
pub struct PersistentStore {
  inner: Mutex<StoreInner>,
  medium: Arc<dyn DurableMedium>,
  clock: Arc<dyn Clock>,
  evict_batch: usize,
}

impl PersistentStore {
  /// Open the store, rehydrating the last persisted snapshot.
  ///
  /// Entries already past their TTL are pruned during load and the cleaned
  /// snapshot is persisted back immediately, so a later crash without a write
  /// still sees a consistent prune. Load failures mean starting empty.
  pub fn open(medium: Arc<dyn DurableMedium>, clock: Arc<dyn Clock>, evict_batch: usize) -> Self {
    let store = Self {
      inner: Mutex::new(StoreInner {
        entries: HashMap::new(),
        subscribers: Vec::new(),
        next_subscription: 0,
      }),
      medium,
      clock,
      evict_batch,
    };
    store.rehydrate();
    store
  }

  fn rehydrate(&self) {
    let payload = match self.medium.read(SNAPSHOT_KEY) {
      Ok(Some(payload)) => payload,
      Ok(None) => return,
      Err(e) => {
        warn!("cache rehydration failed, starting empty: {}", e);
        return;
      }
    };

    let snapshot: Vec<CacheEntry> = match serde_json::from_str(&payload) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        warn!("cache snapshot unreadable, starting empty: {}", e);
        return;
      }
    };

    let now = self.clock.now();
    let total = snapshot.len();
    let mut inner = self.lock_inner();
    for entry in snapshot {
      if entry.is_fresh(now) {
        inner.entries.insert(entry.key.clone(), entry);
      }
    }
    let pruned = total - inner.entries.len();
    if pruned > 0 {
      debug!("pruned {} expired cache entries on load", pruned);
    }

    // Persist the pruned set right away.
    self.persist(&mut inner);
  }

  /// Current time from the store's clock. Freshness decisions made by callers
  /// must use the same clock the store writes timestamps with.
  pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
    self.clock.now()
  }

  // A poisoned lock only means another thread panicked mid-operation; the map
  // itself is still usable and `get` must never fail.
  fn lock_inner(&self) -> MutexGuard<'_, StoreInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Read the full entry for `key` if it exists and is fresh.
  ///
  /// A stale entry is evicted as a side effect and `None` returned.
  pub fn entry(&self, key: &str) -> Option<CacheEntry> {
    let now = self.clock.now();
    let mut inner = self.lock_inner();

    match inner.entries.get(key) {
      Some(entry) if entry.is_fresh(now) => Some(entry.clone()),
      Some(_) => {
        inner.entries.remove(key);
        self.persist(&mut inner);
        None
      }
      None => None,
    }
  }

  /// Read the cached value for `key` if fresh. Never fails.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.entry(key)?;
    match serde_json::from_value(entry.value) {
      Ok(value) => Some(value),
      Err(e) => {
        // Undeserializable payload is as good as a miss; drop it.
        warn!("cached value for '{}' unreadable, evicting: {}", key, e);
        let mut inner = self.lock_inner();
        inner.entries.remove(key);
        self.persist(&mut inner);
        None
      }
    }
  }

  /// Write or replace the entry for `key` and persist the snapshot.
  ///
  /// Persistence failures degrade silently: the in-memory entry is kept either
  /// way, so the cache keeps serving within this session.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
    let value = match serde_json::to_value(value) {
      Ok(value) => value,
      Err(e) => {
        warn!("failed to serialize value for '{}', not caching: {}", key, e);
        return;
      }
    };

    let entry = CacheEntry::new(key.to_string(), value, self.clock.now(), ttl);
    {
      let mut inner = self.lock_inner();
      inner.entries.insert(key.to_string(), entry);
      self.persist(&mut inner);
    }
    self.notify(key);
  }

  /// Remove one entry, or every entry when `key` is `None`.
  pub fn clear(&self, key: Option<&str>) {
    let notify_keys: Vec<String> = {
      let mut inner = self.lock_inner();
      let keys = match key {
        Some(k) => {
          inner.entries.remove(k);
          vec![k.to_string()]
        }
        None => {
          let keys = inner.entries.keys().cloned().collect();
          inner.entries.clear();
          keys
        }
      };
      self.persist(&mut inner);
      keys
    };

    for k in notify_keys {
      self.notify(&k);
    }
  }

  /// Diagnostic counters. Evicts nothing; stale entries stay resident until a
  /// `get` or `set` touches them.
  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now();
    let inner = self.lock_inner();

    let mut stats = CacheStats::default();
    for entry in inner.entries.values() {
      if entry.is_fresh(now) {
        stats.valid_count += 1;
      } else {
        stats.expired_count += 1;
      }
      stats
        .per_key_age
        .insert(entry.key.clone(), entry.age(now).num_milliseconds());
    }
    stats.approx_byte_size = serialize_snapshot(&inner.entries).map_or(0, |s| s.len());
    stats
  }

  /// Register a change callback for one key. Fires after `set` and `clear`,
  /// outside the store lock.
  pub fn subscribe_changes<F>(&self, key: &str, callback: F) -> ChangeSubscriptionId
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    let mut inner = self.lock_inner();
    let id = inner.next_subscription;
    inner.next_subscription += 1;
    inner
      .subscribers
      .push((id, key.to_string(), Arc::new(callback)));
    id
  }

  pub fn unsubscribe(&self, id: ChangeSubscriptionId) {
    let mut inner = self.lock_inner();
    inner.subscribers.retain(|(sub_id, _, _)| *sub_id != id);
  }

  fn notify(&self, key: &str) {
    let callbacks: Vec<ChangeCallback> = {
      let inner = self.lock_inner();
      inner
        .subscribers
        .iter()
        .filter(|(_, sub_key, _)| sub_key == key)
        .map(|(_, _, cb)| Arc::clone(cb))
        .collect()
    };

    for callback in callbacks {
      callback(key);
    }
  }

  /// Persist the snapshot, evicting the oldest entries and retrying once when
  /// the medium reports capacity exceeded.
  fn persist(&self, inner: &mut StoreInner) {
    let payload = match serialize_snapshot(&inner.entries) {
      Ok(payload) => payload,
      Err(e) => {
        warn!("failed to serialize cache snapshot: {}", e);
        return;
      }
    };

    match self.medium.write(SNAPSHOT_KEY, &payload) {
      Ok(()) => {}
      Err(e) if e.is_capacity_exceeded() => {
        debug!(
          "cache medium full, evicting {} oldest entries: {}",
          self.evict_batch, e
        );
        self.evict_oldest(inner, self.evict_batch);

        let retry_payload = match serialize_snapshot(&inner.entries) {
          Ok(payload) => payload,
          Err(e) => {
            warn!("failed to serialize cache snapshot after eviction: {}", e);
            return;
          }
        };
        if let Err(e) = self.medium.write(SNAPSHOT_KEY, &retry_payload) {
          // Still failing: keep serving from memory, skip persistence.
          debug!("cache persistence skipped after eviction retry: {}", e);
        }
      }
      Err(e) => {
        warn!("cache persistence failed: {}", e);
      }
    }
  }

  fn evict_oldest(&self, inner: &mut StoreInner, count: usize) {
    let mut by_age: Vec<(String, chrono::DateTime<chrono::Utc>)> = inner
      .entries
      .values()
      .map(|e| (e.key.clone(), e.written_at))
      .collect();
    by_age.sort_by_key(|(_, written_at)| *written_at);

    for (key, _) in by_age.into_iter().take(count) {
      inner.entries.remove(&key);
    }
  }
}

/// Snapshot is the entries ordered by write time, oldest first.
fn serialize_snapshot(entries: &HashMap<String, CacheEntry>) -> Result<String, StorageError> {
  let mut snapshot: Vec<&CacheEntry> = entries.values().collect();
  snapshot.sort_by(|a, b| {
    a.written_at
      .cmp(&b.written_at)
      .then_with(|| a.key.cmp(&b.key))
  });
  serde_json::to_string(&snapshot).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::medium::MemoryMedium;
  use crate::clock::ManualClock;
  use chrono::Utc;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  fn manual_store(medium: Arc<dyn DurableMedium>) -> (PersistentStore, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let store = PersistentStore::open(medium, Arc::new(clock.clone()), DEFAULT_EVICT_BATCH);
    (store, clock)
  }

  #[test]
  fn round_trip() {
    let (store, _clock) = manual_store(Arc::new(MemoryMedium::new(None)));

    store.set("vix-current", &json!({"spot": 18.2}), Duration::seconds(60));
    let value: Option<Value> = store.get("vix-current");
    assert_eq!(value, Some(json!({"spot": 18.2})));
  }

  #[test]
  fn expiration_evicts_and_leaves_stats() {
    let (store, clock) = manual_store(Arc::new(MemoryMedium::new(None)));

    store.set("vix-current", &json!({"spot": 18.2}), Duration::seconds(60));
    assert_eq!(store.stats().valid_count, 1);

    clock.advance(Duration::seconds(61));
    assert_eq!(store.stats().valid_count, 0);
    assert_eq!(store.stats().expired_count, 1);

    let value: Option<Value> = store.get("vix-current");
    assert_eq!(value, None);

    // Eviction happened on get; the key is gone from the diagnostics too.
    let stats = store.stats();
    assert_eq!(stats.expired_count, 0);
    assert!(!stats.per_key_age.contains_key("vix-current"));
  }

  /// Medium that reports capacity exceeded on one scripted write.
  struct ScriptedMedium {
    inner: MemoryMedium,
    writes: AtomicUsize,
    fail_on_write: usize,
  }

  impl ScriptedMedium {
    fn new(fail_on_write: usize) -> Self {
      Self {
        inner: MemoryMedium::new(None),
        writes: AtomicUsize::new(0),
        fail_on_write,
      }
    }
  }

  impl DurableMedium for ScriptedMedium {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
      self.inner.read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
      let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
      if n == self.fail_on_write {
        return Err(StorageError::CapacityExceeded("quota full".into()));
      }
      self.inner.write(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
      self.inner.remove(key)
    }
  }

  #[test]
  fn capacity_pressure_evicts_five_oldest_and_retries() {
    // Rehydration does not write (empty medium), so the 6th set is the 6th write.
    let (store, clock) = manual_store(Arc::new(ScriptedMedium::new(6)));

    for i in 1..=6 {
      store.set(&format!("k{}", i), &json!(i), Duration::seconds(300));
      clock.advance(Duration::seconds(1));
    }

    for i in 1..=5 {
      let value: Option<Value> = store.get(&format!("k{}", i));
      assert_eq!(value, None, "k{} should have been evicted", i);
    }
    let value: Option<Value> = store.get("k6");
    assert_eq!(value, Some(json!(6)));

    let stats = store.stats();
    assert_eq!(stats.valid_count, 1);
    assert!(stats.per_key_age.contains_key("k6"));
  }

  #[test]
  fn rehydration_prunes_expired_entries() {
    let medium: Arc<dyn DurableMedium> = Arc::new(MemoryMedium::new(None));
    let clock = ManualClock::new(Utc::now());

    {
      let store = PersistentStore::open(
        Arc::clone(&medium),
        Arc::new(clock.clone()),
        DEFAULT_EVICT_BATCH,
      );
      store.set("short", &json!("a"), Duration::seconds(10));
      store.set("long", &json!("b"), Duration::seconds(600));
    }

    clock.advance(Duration::seconds(30));
    let store = PersistentStore::open(medium, Arc::new(clock.clone()), DEFAULT_EVICT_BATCH);

    let short: Option<Value> = store.get("short");
    let long: Option<Value> = store.get("long");
    assert_eq!(short, None);
    assert_eq!(long, Some(json!("b")));

    // The pruned snapshot was persisted back during load.
    let stats = store.stats();
    assert_eq!(stats.valid_count, 1);
    assert_eq!(stats.expired_count, 0);
  }

  /// Medium where every operation fails.
  struct BrokenMedium;

  impl DurableMedium for BrokenMedium {
    fn read(&self, _key: &str) -> Result<Option<String>, StorageError> {
      Err(StorageError::Io("medium unavailable".into()))
    }

    fn write(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
      Err(StorageError::Io("medium unavailable".into()))
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
      Err(StorageError::Io("medium unavailable".into()))
    }
  }

  #[test]
  fn broken_medium_never_surfaces_errors() {
    let (store, _clock) = manual_store(Arc::new(BrokenMedium));

    store.set("k", &json!(1), Duration::seconds(60));
    let value: Option<Value> = store.get("k");
    assert_eq!(value, Some(json!(1)));

    store.clear(None);
    let value: Option<Value> = store.get("k");
    assert_eq!(value, None);
  }

  #[test]
  fn change_callbacks_fire_on_set_and_clear() {
    let (store, _clock) = manual_store(Arc::new(MemoryMedium::new(None)));

    let fired = Arc::new(AtomicUsize::new(0));
    let other_fired = Arc::new(AtomicBool::new(false));

    let fired_cb = Arc::clone(&fired);
    let id = store.subscribe_changes("pnl-summary", move |_| {
      fired_cb.fetch_add(1, Ordering::SeqCst);
    });
    let other_cb = Arc::clone(&other_fired);
    store.subscribe_changes("fleet-status", move |_| {
      other_cb.store(true, Ordering::SeqCst);
    });

    store.set("pnl-summary", &json!({"total": 1200.5}), Duration::seconds(60));
    store.clear(Some("pnl-summary"));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(!other_fired.load(Ordering::SeqCst));

    store.unsubscribe(id);
    store.set("pnl-summary", &json!({"total": 0}), Duration::seconds(60));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
  }
}
