//! Request coordination: deduplicated, auto-refreshing resource subscriptions.
//!
//! The coordinator turns a named remote resource into a managed subscription:
//! conditional fetching, per-key request deduplication, interval refresh,
//! bounded retry with fixed backoff, and manual invalidation. Successful
//! results are written through to the persistent store; failures surface only
//! as a soft `error` field next to whatever data is already cached.
//!
//! Concurrency notes:
//! - Dedup joins subscribers onto one shared in-flight future; the retry
//!   budget lives inside that future, so deduplicated subscribers share it.
//! - Dropping a subscription cancels its refresh timer only. An in-flight
//!   request keeps running; a result arriving after the drop is discarded
//!   rather than applied, so a dead subscriber never writes.
//! - When dedup is bypassed and two flights for one key genuinely overlap,
//!   the later-RESOLVING response wins (each resolution replaces the store
//!   entry wholesale). Accepted trade-off, covered by a test below.

use chrono::Duration as ChronoDuration;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::PersistentStore;
use crate::error::FetchError;

use super::policy::RefreshPolicy;

/// `Ok(None)` means the remote had no data available; it is not an error and
/// does not touch the store.
pub type FetchOutcome = Result<Option<Value>, FetchError>;

/// Factory for fetch futures, invoked once per dispatched attempt.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

type SharedFlight = Shared<BoxFuture<'static, FetchOutcome>>;

/// Per-key concurrency guard. Purely in-memory, never persisted.
struct DedupRecord {
  last_dispatched_at: Instant,
  in_flight: SharedFlight,
}

/// Snapshot of a subscription's public state.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
  pub data: Option<Value>,
  /// Soft error, set only after the retry budget is exhausted. Never erases
  /// known-good data.
  pub error: Option<String>,
  /// True only while fetching with no data to show.
  pub is_loading: bool,
}

struct SubscriptionShared {
  state: Mutex<ResourceState>,
  active: AtomicBool,
  changed: AtomicBool,
  reset_timer: Notify,
}

impl SubscriptionShared {
  fn lock_state(&self) -> MutexGuard<'_, ResourceState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

struct CoordinatorShared {
  store: Arc<PersistentStore>,
  dedup: Mutex<HashMap<String, DedupRecord>>,
  reconnect: Notify,
}

/// Coordinates fetches across all resource subscriptions.
///
/// Cloning is cheap and shares the dedup state; hand clones to whoever needs
/// to subscribe.
#[derive(Clone)]
pub struct RequestCoordinator {
  shared: Arc<CoordinatorShared>,
}

impl RequestCoordinator {
  pub fn new(store: Arc<PersistentStore>) -> Self {
    Self {
      shared: Arc::new(CoordinatorShared {
        store,
        dedup: Mutex::new(HashMap::new()),
        reconnect: Notify::new(),
      }),
    }
  }

  pub fn store(&self) -> Arc<PersistentStore> {
    Arc::clone(&self.shared.store)
  }

  /// Wake every active subscription that revalidates on reconnect.
  pub fn notify_reconnected(&self) {
    self.shared.reconnect.notify_waiters();
  }

  /// Subscribe to a named resource. Must be called within a tokio runtime.
  ///
  /// `key = None` disables fetching entirely: no task is spawned, the fetch fn
  /// is never invoked, and the state stays `{data: None, is_loading: false}`.
  pub fn subscribe(
    &self,
    key: Option<&str>,
    fetch_fn: FetchFn,
    policy: RefreshPolicy,
  ) -> ResourceSubscription {
    let shared = Arc::new(SubscriptionShared {
      state: Mutex::new(ResourceState::default()),
      active: AtomicBool::new(true),
      changed: AtomicBool::new(false),
      reset_timer: Notify::new(),
    });

    let key = match key {
      Some(key) => key.to_string(),
      None => {
        return ResourceSubscription {
          coordinator: self.clone(),
          key: None,
          fetch_fn: None,
          policy,
          shared,
          refresh_task: None,
        }
      }
    };

    // Seed from the store. A fresh cached value means starting IDLE with no
    // immediate fetch; otherwise fetch right away, loading only because
    // nothing exists yet.
    let mut needs_fetch = false;
    match self.shared.store.entry(&key) {
      Some(entry) => {
        let mut state = shared.lock_state();
        state.data = Some(entry.value);
      }
      None => {
        let mut state = shared.lock_state();
        state.is_loading = true;
        needs_fetch = true;
      }
    }

    if needs_fetch {
      tokio::spawn(run_fetch(
        self.clone(),
        key.clone(),
        Arc::clone(&fetch_fn),
        policy.clone(),
        Arc::clone(&shared),
        false,
      ));
    }

    let refresh_task = tokio::spawn(refresh_loop(
      self.clone(),
      key.clone(),
      Arc::clone(&fetch_fn),
      policy.clone(),
      Arc::clone(&shared),
    ));

    ResourceSubscription {
      coordinator: self.clone(),
      key: Some(key),
      fetch_fn: Some(fetch_fn),
      policy,
      shared,
      refresh_task: Some(refresh_task),
    }
  }

  /// Join the in-flight fetch for `key` when one was dispatched within the
  /// dedup window, otherwise dispatch a new one.
  fn acquire_flight(
    &self,
    key: &str,
    fetch_fn: &FetchFn,
    policy: &RefreshPolicy,
    bypass_dedup: bool,
  ) -> SharedFlight {
    let mut dedup = match self.shared.dedup.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let now = Instant::now();
    if !bypass_dedup {
      if let Some(record) = dedup.get(key) {
        if now.duration_since(record.last_dispatched_at) < policy.dedup_window {
          debug!("joining in-flight fetch for '{}'", key);
          return record.in_flight.clone();
        }
      }
    }

    // Retries live inside the flight so deduplicated subscribers share one
    // retry budget.
    let fetch_fn = Arc::clone(fetch_fn);
    let retry_count = policy.retry_count;
    let retry_delay = policy.retry_delay;
    let flight_key = key.to_string();
    let flight: SharedFlight = async move {
      let mut attempt = 0u32;
      loop {
        match fetch_fn().await {
          Ok(value) => return Ok(value),
          Err(e) => {
            if attempt >= retry_count {
              warn!("fetch for '{}' failed after {} retries: {}", flight_key, retry_count, e);
              return Err(e);
            }
            attempt += 1;
            debug!("fetch for '{}' failed, retry {}/{}: {}", flight_key, attempt, retry_count, e);
            tokio::time::sleep(retry_delay).await;
          }
        }
      }
    }
    .boxed()
    .shared();

    dedup.insert(
      key.to_string(),
      DedupRecord {
        last_dispatched_at: now,
        in_flight: flight.clone(),
      },
    );
    flight
  }
}

/// Interval refresh driver for one subscription. Aborted on deactivation; the
/// fetches themselves run as detached tasks and are never aborted.
async fn refresh_loop(
  coordinator: RequestCoordinator,
  key: String,
  fetch_fn: FetchFn,
  policy: RefreshPolicy,
  shared: Arc<SubscriptionShared>,
) {
  loop {
    tokio::select! {
      _ = tokio::time::sleep(policy.interval) => {
        tokio::spawn(run_fetch(
          coordinator.clone(),
          key.clone(),
          Arc::clone(&fetch_fn),
          policy.clone(),
          Arc::clone(&shared),
          false,
        ));
      }
      _ = shared.reset_timer.notified() => {
        // Timer reset after a successful fetch or a manual mutate; fall
        // through and start a new interval.
      }
      _ = coordinator.shared.reconnect.notified(), if policy.revalidate_on_reconnect => {
        tokio::spawn(run_fetch(
          coordinator.clone(),
          key.clone(),
          Arc::clone(&fetch_fn),
          policy.clone(),
          Arc::clone(&shared),
          false,
        ));
      }
    }
  }
}

/// One fetch cycle: FETCHING, then back to IDLE with either fresh data or a
/// soft error. Applies nothing when the subscription deactivated meanwhile.
async fn run_fetch(
  coordinator: RequestCoordinator,
  key: String,
  fetch_fn: FetchFn,
  policy: RefreshPolicy,
  shared: Arc<SubscriptionShared>,
  bypass_dedup: bool,
) {
  if !shared.active.load(Ordering::SeqCst) {
    return;
  }

  {
    let mut state = shared.lock_state();
    if !policy.keep_previous_data_on_refetch {
      state.data = None;
    }
    state.is_loading = state.data.is_none();
  }
  shared.changed.store(true, Ordering::SeqCst);

  let flight = coordinator.acquire_flight(&key, &fetch_fn, &policy, bypass_dedup);
  let result = flight.await;

  // A result arriving after deactivation is discarded, not applied.
  if !shared.active.load(Ordering::SeqCst) {
    return;
  }

  match result {
    Ok(Some(value)) => {
      let ttl = ChronoDuration::milliseconds(policy.ttl.as_millis() as i64);
      coordinator.shared.store.set(&key, &value, ttl);

      let mut state = shared.lock_state();
      state.data = Some(value);
      state.error = None;
      state.is_loading = false;
      drop(state);

      shared.reset_timer.notify_waiters();
    }
    Ok(None) => {
      // Remote reported no data available. Keep whatever we have.
      let mut state = shared.lock_state();
      state.is_loading = false;
      drop(state);

      shared.reset_timer.notify_waiters();
    }
    Err(e) => {
      let mut state = shared.lock_state();
      state.error = Some(e.to_string());
      state.is_loading = false;
      // Data untouched: a late error never erases known-good stale data.
    }
  }
  shared.changed.store(true, Ordering::SeqCst);
}

/// Managed subscription to one named resource.
///
/// Dropping it cancels the refresh timer; an in-flight request is not
/// cancelled, its result is simply discarded.
pub struct ResourceSubscription {
  coordinator: RequestCoordinator,
  key: Option<String>,
  fetch_fn: Option<FetchFn>,
  policy: RefreshPolicy,
  shared: Arc<SubscriptionShared>,
  refresh_task: Option<JoinHandle<()>>,
}

impl ResourceSubscription {
  pub fn key(&self) -> Option<&str> {
    self.key.as_deref()
  }

  pub fn state(&self) -> ResourceState {
    self.shared.lock_state().clone()
  }

  pub fn data(&self) -> Option<Value> {
    self.shared.lock_state().data.clone()
  }

  pub fn error(&self) -> Option<String> {
    self.shared.lock_state().error.clone()
  }

  pub fn is_loading(&self) -> bool {
    self.shared.lock_state().is_loading
  }

  /// True once since the last call if the state changed. Poll from a tick
  /// loop.
  pub fn take_changed(&self) -> bool {
    self.shared.changed.swap(false, Ordering::SeqCst)
  }

  /// Force an immediate fetch-and-store cycle, bypassing the dedup window and
  /// resetting the refresh timer. No-op for a `key = None` subscription.
  pub fn mutate(&self) {
    let (Some(key), Some(fetch_fn)) = (&self.key, &self.fetch_fn) else {
      return;
    };

    self.shared.reset_timer.notify_waiters();
    tokio::spawn(run_fetch(
      self.coordinator.clone(),
      key.clone(),
      Arc::clone(fetch_fn),
      self.policy.clone(),
      Arc::clone(&self.shared),
      true,
    ));
  }

  /// Deactivate explicitly. Equivalent to dropping the subscription.
  pub fn unsubscribe(self) {}
}

impl Drop for ResourceSubscription {
  fn drop(&mut self) {
    self.shared.active.store(false, Ordering::SeqCst);
    if let Some(task) = self.refresh_task.take() {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryMedium, DEFAULT_EVICT_BATCH};
  use crate::clock::SystemClock;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn test_store() -> Arc<PersistentStore> {
    Arc::new(PersistentStore::open(
      Arc::new(MemoryMedium::new(None)),
      Arc::new(SystemClock),
      DEFAULT_EVICT_BATCH,
    ))
  }

  fn counting_fetch(calls: Arc<AtomicUsize>, value: Value) -> FetchFn {
    Arc::new(move || {
      let calls = Arc::clone(&calls);
      let value = value.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(value))
      }
      .boxed()
    })
  }

  fn failing_fetch(calls: Arc<AtomicUsize>) -> FetchFn {
    Arc::new(move || {
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Network("connection refused".into()))
      }
      .boxed()
    })
  }

  fn long_policy() -> RefreshPolicy {
    RefreshPolicy {
      interval: Duration::from_secs(3600),
      dedup_window: Duration::from_secs(2),
      retry_count: 0,
      retry_delay: Duration::from_millis(10),
      ..RefreshPolicy::default()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_subscribers_share_one_dispatch() {
    let coordinator = RequestCoordinator::new(test_store());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(Arc::clone(&calls), json!({"bots": 4}));

    let a = coordinator.subscribe(Some("fleet-status"), Arc::clone(&fetch), long_policy());
    let b = coordinator.subscribe(Some("fleet-status"), fetch, long_policy());

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data(), Some(json!({"bots": 4})));
    assert_eq!(b.data(), Some(json!({"bots": 4})));
    assert!(!a.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn null_key_disables_fetching() {
    let coordinator = RequestCoordinator::new(test_store());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(Arc::clone(&calls), json!(1));

    let sub = coordinator.subscribe(None, fetch, long_policy());
    sub.mutate();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sub.data(), None);
    assert!(!sub.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn interval_refetch_fires_on_schedule() {
    let coordinator = RequestCoordinator::new(test_store());
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(Arc::clone(&calls), json!(1));
    let policy = RefreshPolicy {
      interval: Duration::from_secs(30),
      ..long_policy()
    };

    let _sub = coordinator.subscribe(Some("pnl-summary"), fetch, policy);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // No second dispatch before the interval elapses.
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // One at or after t = 30s.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn retry_exhaustion_surfaces_soft_error_and_keeps_data() {
    let store = test_store();
    store.set(
      "pnl-summary",
      &json!({"total": 1200.5}),
      ChronoDuration::seconds(3600),
    );

    let coordinator = RequestCoordinator::new(Arc::clone(&store));
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = RefreshPolicy {
      retry_count: 3,
      ..long_policy()
    };

    let sub = coordinator.subscribe(Some("pnl-summary"), failing_fetch(Arc::clone(&calls)), policy);
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Fresh cached value: IDLE, no fetch dispatched on mount.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sub.data(), Some(json!({"total": 1200.5})));

    sub.mutate();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Initial attempt plus three retries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(sub.error().is_some());
    assert_eq!(sub.data(), Some(json!({"total": 1200.5})));
    assert!(!sub.is_loading());

    // The store still holds the last good value.
    let cached: Option<Value> = store.get("pnl-summary");
    assert_eq!(cached, Some(json!({"total": 1200.5})));
  }

  #[tokio::test(start_paused = true)]
  async fn later_resolving_fetch_wins_the_race() {
    let store = test_store();
    store.set("gamma-exposure:SPY", &json!("seed"), ChronoDuration::seconds(3600));

    let coordinator = RequestCoordinator::new(Arc::clone(&store));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch: FetchFn = Arc::new({
      let calls = Arc::clone(&calls);
      move || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            // Dispatched first, resolves last.
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Some(json!("slow")))
          } else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Some(json!("fast")))
          }
        }
        .boxed()
      }
    });

    let sub = coordinator.subscribe(Some("gamma-exposure:SPY"), fetch, long_policy());
    // Two mutates bypass the dedup window: two genuinely concurrent flights.
    sub.mutate();
    sub.mutate();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let cached: Option<Value> = store.get("gamma-exposure:SPY");
    assert_eq!(cached, Some(json!("slow")));
    assert_eq!(sub.data(), Some(json!("slow")));
  }

  #[tokio::test(start_paused = true)]
  async fn result_after_drop_is_discarded() {
    let store = test_store();
    let coordinator = RequestCoordinator::new(Arc::clone(&store));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch: FetchFn = Arc::new({
      let calls = Arc::clone(&calls);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(Some(json!("late")))
        }
        .boxed()
      }
    });

    let sub = coordinator.subscribe(Some("bot-logs:alpha"), fetch, long_policy());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(sub);

    tokio::time::sleep(Duration::from_millis(500)).await;
    // The flight ran to completion but its result was not applied.
    let cached: Option<Value> = store.get("bot-logs:alpha");
    assert_eq!(cached, None);
  }

  #[tokio::test(start_paused = true)]
  async fn refetch_without_keep_previous_clears_data() {
    let store = test_store();
    store.set("fleet-status", &json!("old"), ChronoDuration::seconds(3600));

    let coordinator = RequestCoordinator::new(store);
    let fetch: FetchFn = Arc::new(move || {
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some(json!("new")))
      }
      .boxed()
    });
    let policy = RefreshPolicy {
      keep_previous_data_on_refetch: false,
      ..long_policy()
    };

    let sub = coordinator.subscribe(Some("fleet-status"), fetch, policy);
    assert_eq!(sub.data(), Some(json!("old")));

    sub.mutate();
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Mid-flight: previous data hidden, loading shown again.
    assert_eq!(sub.data(), None);
    assert!(sub.is_loading());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sub.data(), Some(json!("new")));
    assert!(!sub.is_loading());
  }

  #[tokio::test(start_paused = true)]
  async fn reconnect_revalidates_opted_in_subscriptions() {
    let store = test_store();
    store.set("fleet-status", &json!(1), ChronoDuration::seconds(3600));
    store.set("pnl-summary", &json!(2), ChronoDuration::seconds(3600));

    let coordinator = RequestCoordinator::new(store);
    let fleet_calls = Arc::new(AtomicUsize::new(0));
    let pnl_calls = Arc::new(AtomicUsize::new(0));

    let _fleet = coordinator.subscribe(
      Some("fleet-status"),
      counting_fetch(Arc::clone(&fleet_calls), json!(1)),
      RefreshPolicy {
        revalidate_on_reconnect: true,
        ..long_policy()
      },
    );
    let _pnl = coordinator.subscribe(
      Some("pnl-summary"),
      counting_fetch(Arc::clone(&pnl_calls), json!(2)),
      RefreshPolicy {
        revalidate_on_reconnect: false,
        ..long_policy()
      },
    );

    // Let both refresh loops reach their select before signalling.
    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.notify_reconnected();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pnl_calls.load(Ordering::SeqCst), 0);
  }
}
