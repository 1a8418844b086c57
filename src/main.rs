mod cache;
mod commands;
mod config;
mod controller;
mod dispatch;
mod event;
mod net;
mod routes;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conv-cache")]
#[command(about = "Versioned offline cache for the currency conversion app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/conv-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache version to use instead of the configured one
  #[arg(long, global = true)]
  cache_version: Option<String>,

  /// Log to stderr instead of the log file
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override cache version if specified on command line
  let config = if let Some(cache_version) = args.cache_version {
    if cache_version.trim().is_empty() {
      return Err(eyre!("--cache-version must not be empty"));
    }
    config::Config {
      cache_version,
      ..config
    }
  } else {
    config
  };

  commands::run(args.command, &config).await
}

/// Set up tracing. Logs go to a daily file unless `verbose` is set.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conv_cache=info"));

  if verbose {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("conv-cache")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "conv-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
