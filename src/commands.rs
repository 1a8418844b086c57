//! CLI subcommands driving a worker host against the persistent cache.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::controller::CacheController;
use crate::dispatch::Dispatcher;
use crate::event::{WorkerHost, WorkerState};
use crate::net::{Fetcher, HttpFetcher, Request};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Pre-cache every configured asset into the current bucket
  Install,
  /// Remove every bucket except the current one
  Activate,
  /// Install, then activate
  Update,
  /// Serve URLs through the cache, concurrently
  Fetch {
    /// Absolute URLs, or paths relative to the configured origin
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// List stored buckets and their entries
  Buckets,
}

/// Run a subcommand.
pub async fn run(command: Command, config: &Config) -> Result<()> {
  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);

  if let Command::Buckets = command {
    return list_buckets(storage.as_ref(), &config.cache_version);
  }

  let fetcher = Arc::new(HttpFetcher::new()?);
  let host = start_worker(config, storage, fetcher)?;

  match command {
    Command::Install => install(&host).await,
    Command::Activate => activate(&host).await,
    Command::Update => {
      install(&host).await?;
      activate(&host).await
    }
    Command::Fetch { urls } => {
      // A waiting worker takes over before serving
      if host.state() == WorkerState::Installed {
        activate(&host).await?;
      }
      fetch(&host, config, &urls).await
    }
    Command::Buckets => Ok(()),
  }
}

/// Build the controller and start a host for it.
///
/// The worker resumes as installed only when a previous install of its
/// bucket completed. An empty bucket left by a failed install does not count.
fn start_worker<S, F>(config: &Config, storage: Arc<S>, fetcher: Arc<F>) -> Result<WorkerHost>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  let initial = if storage.is_complete(&config.cache_version)? {
    WorkerState::Installed
  } else {
    WorkerState::Parsed
  };
  let controller = CacheController::new(
    storage,
    Arc::clone(&fetcher),
    config.cache_version.clone(),
    config.asset_urls()?,
    config.route_table(),
  );
  info!(version = %controller.version(), state = %initial, "Starting worker");

  let mut dispatcher = Dispatcher::new();
  controller.register(&mut dispatcher);

  Ok(WorkerHost::spawn(dispatcher, fetcher, initial))
}

async fn install(host: &WorkerHost) -> Result<()> {
  if host.state() == WorkerState::Installed {
    println!("Already installed");
    return Ok(());
  }

  if let Some(report) = host.install().await? {
    println!(
      "Installed {} ({} assets)",
      report.bucket,
      report.stored.len()
    );
    for url in &report.stored {
      println!("  {}", url);
    }
  }
  Ok(())
}

async fn activate(host: &WorkerHost) -> Result<()> {
  if let Some(report) = host.activate().await? {
    println!("Activated {}", report.current);
    for bucket in &report.deleted {
      println!("  removed {}", bucket);
    }
  }
  Ok(())
}

async fn fetch(host: &WorkerHost, config: &Config, urls: &[String]) -> Result<()> {
  let requests = urls
    .iter()
    .map(|u| config.resolve(u).map(Request::get))
    .collect::<Result<Vec<_>>>()?;

  let results = join_all(requests.into_iter().map(|request| async move {
    let url = request.url.clone();
    (url, host.fetch(request).await)
  }))
  .await;

  let mut failed = 0;
  for (url, result) in results {
    match result {
      Ok(served) => {
        let age = served
          .cached_at
          .map(|at| format!(" (cached {})", at.format("%Y-%m-%d %H:%M:%S")))
          .unwrap_or_default();
        println!(
          "{} {:<7} {:>8}B {}{}",
          served.response.status,
          served.source,
          served.response.body.len(),
          url,
          age
        );
      }
      Err(err) => {
        failed += 1;
        println!("ERR {:<7} {:>9} {} ({})", "-", "-", url, err);
      }
    }
  }

  if failed > 0 {
    return Err(eyre!("{} of {} requests failed", failed, urls.len()));
  }
  Ok(())
}

fn list_buckets<S: CacheStorage>(storage: &S, current: &str) -> Result<()> {
  let buckets = storage.keys()?;
  if buckets.is_empty() {
    println!("No buckets stored");
    return Ok(());
  }

  for bucket in buckets {
    let marker = if bucket == current { "*" } else { " " };
    let entries = storage.entries(&bucket)?;
    println!("{} {} ({} entries)", marker, bucket, entries.len());
    for url in entries {
      println!("    {}", url);
    }
  }
  Ok(())
}
