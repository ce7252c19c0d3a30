//! Named fleet resources and the client that binds them to subscriptions.

use futures::FutureExt;
use std::sync::Arc;

use crate::sync::{FetchFn, FetchOutcome, RefreshPolicy, RequestCoordinator, ResourceSubscription};

use super::client::ApiClient;

/// Remote resources served by the fleet API.
///
/// Read resources are GETs; action resources are POSTs that change server
/// state and are never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
  /// Status of every bot in the fleet.
  FleetStatus,
  /// Aggregate P&L.
  PnlSummary,
  /// Gamma exposure surface for one symbol.
  GammaExposure { symbol: String },
  /// Recent log lines for one bot.
  BotLogs { bot: String },
  /// Current VIX spot reading.
  VixCurrent,
  /// Kick off a model retrain for one bot. Action.
  Retrain { bot: String },
  /// Clear the server-side log buffer for one bot. Action.
  ClearLogs { bot: String },
}

impl Resource {
  /// Cache key: resource name, optionally parameterized by symbol or bot id.
  /// Unique within one store; collisions silently overwrite.
  pub fn cache_key(&self) -> String {
    match self {
      Resource::FleetStatus => "fleet-status".to_string(),
      Resource::PnlSummary => "pnl-summary".to_string(),
      Resource::GammaExposure { symbol } => format!("gamma-exposure:{}", symbol),
      Resource::BotLogs { bot } => format!("bot-logs:{}", bot),
      Resource::VixCurrent => "vix-current".to_string(),
      Resource::Retrain { bot } => format!("retrain:{}", bot),
      Resource::ClearLogs { bot } => format!("clear-logs:{}", bot),
    }
  }

  /// Request path relative to the configured base endpoint.
  pub fn path(&self) -> String {
    match self {
      Resource::FleetStatus => "fleet/status".to_string(),
      Resource::PnlSummary => "fleet/pnl".to_string(),
      Resource::GammaExposure { symbol } => format!("market/gamma/{}", symbol),
      Resource::BotLogs { bot } => format!("bots/{}/logs", bot),
      Resource::VixCurrent => "market/vix".to_string(),
      Resource::Retrain { bot } => format!("bots/{}/retrain", bot),
      Resource::ClearLogs { bot } => format!("bots/{}/logs/clear", bot),
    }
  }

  /// Actions mutate server state and go out as POSTs.
  pub fn is_action(&self) -> bool {
    matches!(self, Resource::Retrain { .. } | Resource::ClearLogs { .. })
  }
}

/// Fleet API client with managed, cached subscriptions per resource.
///
/// Wraps the raw `ApiClient` and the request coordinator; presentation code
/// only ever sees `ResourceSubscription` handles and action results.
#[derive(Clone)]
pub struct FleetClient {
  api: ApiClient,
  coordinator: RequestCoordinator,
}

impl FleetClient {
  pub fn new(api: ApiClient, coordinator: RequestCoordinator) -> Self {
    Self { api, coordinator }
  }

  pub fn coordinator(&self) -> &RequestCoordinator {
    &self.coordinator
  }

  /// Build the fetch fn for a read resource.
  fn fetcher(&self, resource: &Resource) -> FetchFn {
    let api = self.api.clone();
    let path = resource.path();
    Arc::new(move || {
      let api = api.clone();
      let path = path.clone();
      async move { api.get_resource(&path).await }.boxed()
    })
  }

  /// Subscribe to a read resource under the given policy.
  pub fn subscribe(&self, resource: &Resource, policy: RefreshPolicy) -> ResourceSubscription {
    debug_assert!(!resource.is_action(), "actions are not subscribable");
    let key = resource.cache_key();
    self
      .coordinator
      .subscribe(Some(&key), self.fetcher(resource), policy)
  }

  /// Subscribe conditionally: `None` disables fetching entirely until the
  /// caller resubscribes with a concrete resource.
  pub fn subscribe_optional(
    &self,
    resource: Option<&Resource>,
    policy: RefreshPolicy,
  ) -> ResourceSubscription {
    match resource {
      Some(resource) => self.subscribe(resource, policy),
      None => {
        let noop: FetchFn = Arc::new(|| async { Ok(None) }.boxed());
        self.coordinator.subscribe(None, noop, policy)
      }
    }
  }

  /// Run an action resource (POST). The caller is expected to `mutate()` any
  /// subscription whose server-side data the action changed.
  pub async fn run_action(&self, resource: &Resource) -> FetchOutcome {
    debug_assert!(resource.is_action(), "read resources are fetched, not run");
    self.api.post_action(&resource.path()).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cache_keys_are_parameterized() {
    assert_eq!(Resource::FleetStatus.cache_key(), "fleet-status");
    assert_eq!(Resource::VixCurrent.cache_key(), "vix-current");
    assert_eq!(
      Resource::GammaExposure {
        symbol: "SPY".into()
      }
      .cache_key(),
      "gamma-exposure:SPY"
    );
    assert_eq!(
      Resource::BotLogs {
        bot: "vega-alpha".into()
      }
      .cache_key(),
      "bot-logs:vega-alpha"
    );
  }

  #[test]
  fn only_mutating_resources_are_actions() {
    assert!(!Resource::FleetStatus.is_action());
    assert!(!Resource::GammaExposure { symbol: "QQQ".into() }.is_action());
    assert!(Resource::Retrain { bot: "b1".into() }.is_action());
    assert!(Resource::ClearLogs { bot: "b1".into() }.is_action());
  }

  #[test]
  fn action_paths_nest_under_their_bot() {
    assert_eq!(
      Resource::Retrain { bot: "b1".into() }.path(),
      "bots/b1/retrain"
    );
    assert_eq!(
      Resource::ClearLogs { bot: "b1".into() }.path(),
      "bots/b1/logs/clear"
    );
  }
}
