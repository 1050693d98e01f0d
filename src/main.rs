mod cache;
mod commands;
mod config;
mod db;
mod http;
mod logging;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "An offline-first caching proxy for web app shells")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./precache.yaml or $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Upstream application URL
  #[arg(short, long, global = true)]
  upstream: Option<String>,

  /// Cache database path
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Write logs to a daily rolling file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and run the proxy
  Serve {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Keep cache stores in memory only
    #[arg(long)]
    ephemeral: bool,
  },
  /// Precache the configured version and prune older ones
  Install,
  /// List cache stores
  Stores,
  /// List the entries in a cache store
  Entries {
    /// Store name (default: the configured version)
    name: Option<String>,
  },
  /// Delete every cache store
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Held until exit so buffered log lines get flushed
  let _log_guard = logging::init(args.log_file.as_deref(), args.verbose)?;

  let overrides = config::Overrides {
    upstream: args.upstream,
    database: args.database,
    listen: match &args.command {
      Command::Serve { listen, .. } => *listen,
      _ => None,
    },
  };

  let config_path = config::Config::locate(args.config.as_deref())?;
  let config = config::Config::load_from_path(&config_path, &overrides)?;

  match args.command {
    Command::Serve { ephemeral, .. } => {
      commands::serve(config, config_path, overrides, ephemeral).await
    }
    Command::Install => commands::install(config).await,
    Command::Stores => commands::stores(&config),
    Command::Entries { name } => commands::entries(&config, name.as_deref()),
    Command::Clear => commands::clear(&config),
  }
}
