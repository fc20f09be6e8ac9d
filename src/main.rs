use clap::{Parser, Subcommand};
use color_eyre::Result;
use offline_relay::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use offline_relay::config::Config;
use offline_relay::engine::Interceptor;
use offline_relay::lifecycle::{spawn_triggers, Lifecycle};
use offline_relay::logging;
use offline_relay::network::HttpNetwork;
use offline_relay::notify::BroadcastNotifier;
use offline_relay::replay::ReplayOutcome;
use offline_relay::server::{self, RelayState, Upstream};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "An offline-capable caching relay for TODO web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep everything in memory instead of the SQLite database
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
  /// Run the relay server (default)
  Serve,
  /// Replay the offline queue once and exit
  Replay,
  /// Print cache and queue status
  Status,
  /// Drop queued writes or dead letters
  Purge {
    /// Drop dead letters (the default)
    #[arg(long)]
    dead_letters: bool,
    /// Drop pending queued writes
    #[arg(long)]
    queue: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;
  let command = args.command.unwrap_or(Command::Serve);

  if args.ephemeral {
    run(config, command, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = SqliteStorage::open(config.cache.database.as_deref())?;
    run(config, command, Arc::new(storage)).await
  }
}

async fn run<S: CacheStorage + 'static>(config: Config, command: Command, storage: Arc<S>) -> Result<()> {
  let network = Arc::new(HttpNetwork::new(config.request_timeout())?);
  let events = BroadcastNotifier::new(64);
  let engine = Arc::new(Interceptor::new(
    network,
    storage,
    config.engine_settings()?,
    Arc::new(events.clone()),
  ));

  match command {
    Command::Serve => {
      let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&engine),
        config.version.clone(),
        config.manifest_urls()?,
      ));

      // Only a first install can fail here; the relay then passes requests straight through
      match lifecycle.install().await {
        Ok(()) => {
          lifecycle.activate().await?;
        }
        Err(e) => error!("Serving without offline support: {}", e),
      }

      let (triggers, _dispatcher) = spawn_triggers(Arc::clone(&engine), config.periodic_interval());
      let state = RelayState::new(lifecycle, triggers, events, Upstream::from_config(&config));
      server::serve(config.listen, state).await
    }
    Command::Replay => {
      engine.claim();
      match engine.replay().await? {
        ReplayOutcome::Empty => println!("Offline queue is empty"),
        ReplayOutcome::AlreadyRunning => println!("A replay is already running"),
        ReplayOutcome::Finished(report) => {
          println!("Synced {}, remaining {}", report.synced, report.remaining);
          if let Some(halt) = report.halted {
            println!("Halted: {:?}", halt);
          }
        }
      }
      Ok(())
    }
    Command::Status => {
      let namespaces = engine.namespaces();
      println!("Version:      {}", config.version);
      println!("Static cache: {}", namespaces.static_assets);
      println!("API cache:    {}", namespaces.api);
      for name in engine.storage().namespaces()? {
        println!("  {} ({} entries)", name, engine.storage().entry_count(&name)?);
      }
      println!("Queued:       {}", engine.queue().len()?);
      println!("Dead letters: {}", engine.queue().dead_letters()?.len());
      Ok(())
    }
    Command::Purge { dead_letters, queue } => {
      if queue {
        println!("Dropped {} queued writes", engine.queue().purge()?);
      }
      if dead_letters || !queue {
        println!("Dropped {} dead letters", engine.queue().purge_dead_letters()?);
      }
      Ok(())
    }
  }
}
