use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shopsync::cache::{KeyValueStore, MemoryStorage, SqliteStorage};
use shopsync::clock::SystemClock;
use shopsync::config::Config;
use shopsync::remote::{Remote, RestRemote};
use shopsync::SyncService;

#[derive(Parser, Debug)]
#[command(name = "shopsync")]
#[command(about = "Offline-tolerant sync for shop inventory and sales")]
#[command(version)]
struct Args {
  /// Path to config file (default: $SHOPSYNC_CONFIG, ./shopsync.yaml, then $XDG_CONFIG_HOME/shopsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Owner to act as when the backend has no session
  #[arg(short, long, global = true)]
  owner: Option<String>,

  /// Never contact the backend
  #[arg(long, global = true)]
  offline: bool,

  /// Keep everything in process memory instead of the SQLite store
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Refresh every collection
  Sync {
    /// Ignore the minimum refresh interval
    #[arg(short, long)]
    force: bool,
  },

  /// Show request budget, cache and snapshot state
  Status,

  /// Drop fallback snapshots older than the configured age
  Cleanup {
    /// Override the configured age, in days
    #[arg(long)]
    max_age_days: Option<u64>,
  },

  /// Forget everything stored locally for the owner
  Clear,
}

/// Log to a daily rolling file; `SHOPSYNC_LOG` takes an `EnvFilter` directive.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("shopsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "shopsync.log",
  ));
  let filter = EnvFilter::try_from_env("SHOPSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

fn open_store(config: &Config, ephemeral: bool) -> Result<Arc<dyn KeyValueStore>> {
  if ephemeral {
    return Ok(Arc::new(MemoryStorage::new()));
  }
  let storage = match &config.storage.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  Ok(Arc::new(storage))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let mut config = Config::load(args.config.as_deref())?;
  if args.offline {
    config.sync.offline_mode = true;
  }
  if let Command::Cleanup {
    max_age_days: Some(days),
  } = args.command
  {
    config.sync.stale_after_days = days;
  }

  let store = open_store(&config, args.ephemeral)?;
  let remote = RestRemote::new(&config.remote)?;

  // A live backend session decides the owner; flags and config cover offline use
  let identity = if config.sync.offline_mode {
    None
  } else {
    remote.current_identity().await
  };
  let owner = identity
    .or(args.owner)
    .or_else(|| config.owner_id.clone())
    .ok_or_else(|| {
      eyre!("No owner: set SHOPSYNC_ACCESS_TOKEN, pass --owner, or set owner_id in the config")
    })?;

  let service = SyncService::new(remote, store, Arc::new(SystemClock), config.sync_config());
  service.init(&owner);
  info!(owner = %owner, command = ?args.command, "starting");

  match args.command {
    Command::Sync { force } => match service.refresh_now(force).await {
      Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
      None => println!("Refresh skipped: throttled or already running"),
    },
    Command::Status => {
      println!("{}", serde_json::to_string_pretty(&service.diagnostics())?);
    }
    Command::Cleanup { .. } => {
      let removed = service.cleanup_stale();
      println!("Removed {} stale snapshot(s)", removed);
    }
    Command::Clear => {
      service.clear_local_data();
      println!("Cleared local data for {}", owner);
    }
  }

  Ok(())
}
