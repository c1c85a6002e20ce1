//! driftsync CLI - keeps an object-metadata index consistent with files
//! written directly to the volume backing it

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod commands;
mod logging;

use commands::{cmd_consume, cmd_crawl_once, cmd_run};
use driftsync_core::Config;
use logging::init_logging;

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "Change capture and reconciliation for an object-metadata index")]
#[command(after_help = "\
QUICK START:
  driftsync run                   # All capture backends
  driftsync watch                 # Live watcher only (publishes to broker)
  driftsync consume               # Broker consumer (separate process)
  driftsync crawl --once          # Single reconciliation pass

CONFIG LOCATIONS:
  ./driftsync.toml, then ~/.config/driftsync/config.toml")]
struct Cli {
  /// Config file path
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Override the configured volume root
  #[arg(long, global = true)]
  volume_root: Option<PathBuf>,

  /// Write rolling log files here instead of the console
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the capture backends (changelog, watch, crawl)
  Run {
    /// Disable the changelog backend
    #[arg(long)]
    no_changelog: bool,
    /// Disable the live watch backend
    #[arg(long)]
    no_watch: bool,
    /// Disable the reconciliation crawler
    #[arg(long)]
    no_crawl: bool,
  },
  /// Live filesystem watcher only
  Watch,
  /// Changelog tailer only
  Changelog,
  /// Reconciliation crawler
  Crawl {
    /// Run one pass and exit
    #[arg(long)]
    once: bool,
  },
  /// Consume broker events into index updates
  Consume,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let mut config = match &cli.config {
    Some(path) => Config::load(path),
    None => Config::load_default(),
  };
  if let Some(root) = cli.volume_root {
    config.volume_root = root;
  }

  let _guard = init_logging(&config.log, cli.log_dir.as_deref());
  let config = Arc::new(config);

  match cli.command {
    Commands::Run {
      no_changelog,
      no_watch,
      no_crawl,
    } => cmd_run(config, !no_changelog, !no_watch, !no_crawl).await,
    Commands::Watch => cmd_run(config, false, true, false).await,
    Commands::Changelog => cmd_run(config, true, false, false).await,
    Commands::Crawl { once: true } => cmd_crawl_once(config).await,
    Commands::Crawl { once: false } => cmd_run(config, false, false, true).await,
    Commands::Consume => cmd_consume(config).await,
  }
}
