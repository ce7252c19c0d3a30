use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RefreshPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub refresh: RefreshConfig,
  #[serde(default)]
  pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base endpoint for the fleet API.
  pub url: String,
  /// Transport-level request timeout. This is the only timeout: subscriptions
  /// have none of their own.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Override for the cache database location (default: platform data dir).
  pub path: Option<PathBuf>,
  /// TTL applied to cached fetch results.
  pub default_ttl_secs: u64,
  /// Oldest entries evicted per capacity-exceeded incident.
  pub evict_batch: usize,
  /// Snapshot byte quota enforced by the medium, if any.
  pub max_snapshot_bytes: Option<usize>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      default_ttl_secs: 60,
      evict_batch: 5,
      max_snapshot_bytes: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
  pub interval_secs: u64,
  pub dedup_window_ms: u64,
  pub retry_count: u32,
  pub retry_delay_ms: u64,
  pub revalidate_on_reconnect: bool,
  pub keep_previous_data_on_refetch: bool,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      dedup_window_ms: 2000,
      retry_count: 3,
      retry_delay_ms: 5000,
      revalidate_on_reconnect: true,
      keep_previous_data_on_refetch: true,
    }
  }
}

impl RefreshConfig {
  /// Policy for a new subscription, with the cache TTL to write results with.
  pub fn policy(&self, ttl: Duration) -> RefreshPolicy {
    RefreshPolicy {
      interval: Duration::from_secs(self.interval_secs),
      dedup_window: Duration::from_millis(self.dedup_window_ms),
      retry_count: self.retry_count,
      retry_delay: Duration::from_millis(self.retry_delay_ms),
      ttl,
      revalidate_on_reconnect: self.revalidate_on_reconnect,
      keep_previous_data_on_refetch: self.keep_previous_data_on_refetch,
    }
  }
}

/// What the watcher subscribes to at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  /// Symbols to watch gamma exposure for.
  pub symbols: Vec<String>,
  /// Bots to tail logs for.
  pub bots: Vec<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetdeck/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fleetdeck/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fleetdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetdeck").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_secs)
  }
}
