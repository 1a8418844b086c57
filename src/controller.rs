//! Offline cache controller: install, activate and fetch interception.

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, RequestKey, Served};
use crate::dispatch::{Dispatcher, Event, EventKind, Outcome};
use crate::net::{Fetcher, Request};
use crate::routes::{RouteTable, Strategy};

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub bucket: String,
  /// URLs stored into the bucket
  pub stored: Vec<String>,
}

/// Result of a successful activate.
#[derive(Debug, Clone)]
pub struct ActivateReport {
  pub current: String,
  /// Stale buckets that existed and were removed
  pub deleted: Vec<String>,
}

/// Owns the current cache bucket and decides how requests are served.
///
/// The controller keeps no state of its own between calls; everything it
/// knows across invocations lives in the storage backend.
pub struct CacheController<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  version: String,
  assets: Arc<Vec<Url>>,
  routes: Arc<RouteTable>,
}

impl<S: CacheStorage, F: Fetcher> CacheController<S, F> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    version: impl Into<String>,
    assets: Vec<Url>,
    routes: RouteTable,
  ) -> Self {
    Self {
      storage,
      fetcher,
      version: version.into(),
      assets: Arc::new(assets),
      routes: Arc::new(routes),
    }
  }

  /// Name of the current bucket.
  pub fn version(&self) -> &str {
    &self.version
  }

  /// Pre-cache every asset into the current bucket.
  ///
  /// All assets are fetched before anything is written. If any of them fails
  /// (transport error or non-2xx status) nothing from this install is stored
  /// and the whole install fails.
  pub async fn install(&self) -> Result<InstallReport> {
    info!(
      bucket = %self.version,
      assets = self.assets.len(),
      "Installing cache version"
    );

    self.storage.open_bucket(&self.version)?;

    let fetches = self.assets.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .wrap_err_with(|| format!("Failed to pre-cache {}", url))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Failed to pre-cache {}: server answered {}",
          url,
          response.status
        ));
      }

      debug!(url = %url, bytes = response.body.len(), "Fetched asset");
      Ok((RequestKey::for_url(url), response))
    });

    let entries = try_join_all(fetches)
      .await
      .wrap_err_with(|| format!("Install of {} aborted", self.version))?;

    self.storage.put_all(&self.version, &entries)?;

    let stored: Vec<String> = entries
      .iter()
      .map(|(key, _)| key.url().to_string())
      .collect();
    info!(bucket = %self.version, stored = stored.len(), "Install complete");

    Ok(InstallReport {
      bucket: self.version.clone(),
      stored,
    })
  }

  /// Delete every bucket other than the current one.
  ///
  /// All deletions are issued together with no ordering between them; the
  /// storage backend decides whether they actually overlap (`SqliteStorage`
  /// runs them one at a time behind its connection lock). A bucket that is
  /// already gone is skipped.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let stale: Vec<String> = self
      .storage
      .keys()?
      .into_iter()
      .filter(|name| name != &self.version)
      .collect();

    info!(bucket = %self.version, stale = stale.len(), "Activating cache version");

    let deletions = stale.iter().map(|name| async move {
      let existed = self.storage.delete_bucket(name)?;
      if existed {
        info!(bucket = %name, "Deleted stale bucket");
      } else {
        debug!(bucket = %name, "Stale bucket already gone");
      }
      Ok::<_, color_eyre::Report>(existed.then(|| name.clone()))
    });

    let deleted = try_join_all(deletions)
      .await
      .wrap_err_with(|| format!("Activation of {} failed", self.version))?
      .into_iter()
      .flatten()
      .collect();

    Ok(ActivateReport {
      current: self.version.clone(),
      deleted,
    })
  }

  /// Serve an intercepted request according to the route table.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Served> {
    let strategy = self.routes.strategy_for(&request.url);
    debug!(method = %request.method, url = %request.url, %strategy, "Intercepted fetch");

    match strategy {
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
    }
  }

  /// Network, then the cached copy of this exact request.
  async fn network_first(&self, request: &Request) -> Result<Served> {
    match self.fetcher.fetch(request).await {
      Ok(response) => Ok(Served::from_network(response)),
      Err(err) => {
        warn!(url = %request.url, error = %err, "Network failed, trying cache");
        match self.lookup(request)? {
          Some(cached) => Ok(Served::offline(cached)),
          None => Err(err.wrap_err(format!("No cached response for {}", request.url))),
        }
      }
    }
  }

  /// Cache, then network. Network responses are not written back.
  async fn cache_first(&self, request: &Request) -> Result<Served> {
    if let Some(cached) = self.lookup(request)? {
      debug!(url = %request.url, "Cache hit");
      return Ok(Served::from_cache(cached));
    }

    debug!(url = %request.url, "Cache miss");
    let response = self.fetcher.fetch(request).await?;
    Ok(Served::from_network(response))
  }

  fn lookup(&self, request: &Request) -> Result<Option<CachedResponse>> {
    match request.cache_key() {
      Some(key) => self.storage.match_request(&self.version, &key),
      None => Ok(None),
    }
  }
}

impl<S, F> CacheController<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  /// Register the install, activate and fetch handlers.
  pub fn register(&self, dispatcher: &mut Dispatcher) {
    let controller = self.clone();
    dispatcher.on(EventKind::Install, move |_| {
      let controller = controller.clone();
      async move { controller.install().await.map(Outcome::Installed) }
    });

    let controller = self.clone();
    dispatcher.on(EventKind::Activate, move |_| {
      let controller = controller.clone();
      async move { controller.activate().await.map(Outcome::Activated) }
    });

    let controller = self.clone();
    dispatcher.on(EventKind::Fetch, move |event| {
      let controller = controller.clone();
      async move {
        match event {
          Event::Fetch(request) => controller
            .handle_fetch(&request)
            .await
            .map(Outcome::Responded),
          other => Err(eyre!("Fetch handler got a {} event", other.kind())),
        }
      }
    });
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheController<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      version: self.version.clone(),
      assets: Arc::clone(&self.assets),
      routes: Arc::clone(&self.routes),
    }
  }
}
