use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetdeck::api::{ApiClient, FleetClient, Resource};
use fleetdeck::cache::{PersistentStore, SqliteMedium};
use fleetdeck::clock::SystemClock;
use fleetdeck::config::Config;
use fleetdeck::sync::RequestCoordinator;

#[derive(Parser, Debug)]
#[command(name = "fleetdeck")]
#[command(about = "Cache-backed data watcher for a trading-bot fleet")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fleetdeck/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Additional symbols to watch gamma exposure for
  #[arg(short, long)]
  symbol: Vec<String>,

  /// Additional bots to tail logs for
  #[arg(short, long)]
  bot: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing()?;

  let mut config = Config::load(args.config.as_deref())?;
  config.watch.symbols.extend(args.symbol);
  config.watch.bots.extend(args.bot);

  // Exactly one store owns the snapshot for the whole session; everything
  // downstream shares this Arc.
  let medium = match &config.cache.path {
    Some(path) => SqliteMedium::open_at(path, config.cache.max_snapshot_bytes)?,
    None => SqliteMedium::open(config.cache.max_snapshot_bytes)?,
  };
  let store = Arc::new(PersistentStore::open(
    Arc::new(medium),
    Arc::new(SystemClock),
    config.cache.evict_batch,
  ));

  let coordinator = RequestCoordinator::new(Arc::clone(&store));
  let api = ApiClient::new(&config.api)?;
  let fleet = FleetClient::new(api, coordinator);

  let policy = config.refresh.policy(config.cache_ttl());

  let mut subscriptions = vec![
    fleet.subscribe(&Resource::FleetStatus, policy.clone()),
    fleet.subscribe(&Resource::PnlSummary, policy.clone()),
    fleet.subscribe(&Resource::VixCurrent, policy.clone()),
  ];
  for symbol in &config.watch.symbols {
    subscriptions.push(fleet.subscribe(
      &Resource::GammaExposure {
        symbol: symbol.clone(),
      },
      policy.clone(),
    ));
  }
  for bot in &config.watch.bots {
    subscriptions.push(fleet.subscribe(&Resource::BotLogs { bot: bot.clone() }, policy.clone()));
  }

  info!("watching {} fleet resources", subscriptions.len());

  let mut tick = tokio::time::interval(Duration::from_secs(1));
  loop {
    tokio::select! {
      _ = tick.tick() => {
        for sub in &subscriptions {
          if sub.take_changed() {
            let state = sub.state();
            let key = sub.key().unwrap_or("-");
            match &state.error {
              Some(error) => info!("{}: stale-while-error ({})", key, error),
              None if state.is_loading => info!("{}: loading", key),
              None => info!("{}: updated", key),
            }
          }
        }
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  let stats = store.stats();
  info!(
    "cache at exit: {} valid, {} expired, ~{} bytes",
    stats.valid_count, stats.expired_count, stats.approx_byte_size
  );

  Ok(())
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .map(|d| d.join("fleetdeck").join("logs"))
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)?;

  let appender = tracing_appender::rolling::daily(log_dir, "fleetdeck.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
