//! Refresh policy for managed resource subscriptions.

use std::time::Duration;

/// Per-subscription refresh behavior.
///
/// Created when a subscription activates and dropped with it. The TTL here is
/// what successful fetch results are written to the persistent store with.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
  /// How often an active subscription refetches.
  pub interval: Duration,
  /// Window within which repeated dispatches for one key collapse into a
  /// single in-flight fetch.
  pub dedup_window: Duration,
  /// Failed fetches are retried this many times before surfacing an error.
  pub retry_count: u32,
  /// Fixed backoff between retries.
  pub retry_delay: Duration,
  /// Cache TTL applied to successful results.
  pub ttl: Duration,
  /// Revalidate when connectivity returns.
  pub revalidate_on_reconnect: bool,
  /// Keep showing the previous value while a refetch is in flight. When false,
  /// the value is cleared and the loading state reappears.
  pub keep_previous_data_on_refetch: bool,
}

impl Default for RefreshPolicy {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      dedup_window: Duration::from_secs(2),
      retry_count: 3,
      retry_delay: Duration::from_secs(5),
      ttl: Duration::from_secs(60),
      revalidate_on_reconnect: true,
      keep_previous_data_on_refetch: true,
    }
  }
}

impl RefreshPolicy {
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builders_override_only_their_field() {
    let policy = RefreshPolicy::default()
      .with_interval(Duration::from_secs(10))
      .with_ttl(Duration::from_secs(120));

    assert_eq!(policy.interval, Duration::from_secs(10));
    assert_eq!(policy.ttl, Duration::from_secs(120));
    assert_eq!(policy.dedup_window, Duration::from_secs(2));
    assert_eq!(policy.retry_count, 3);
    assert!(policy.keep_previous_data_on_refetch);
  }
}
