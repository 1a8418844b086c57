use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::Served;
use crate::controller::{ActivateReport, InstallReport};
use crate::dispatch::{Dispatcher, Event, Outcome};
use crate::net::{Fetcher, Request};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, not installed yet
  Parsed,
  Installing,
  /// Installed, waiting to take over
  Installed,
  Activating,
  /// Active and intercepting fetches
  Activated,
  /// Install failed; this worker will never run
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// An event together with its completion handle
struct Envelope {
  event: Event,
  done: oneshot::Sender<Result<Outcome>>,
}

/// Host side of a worker: delivers events and waits for their completion.
///
/// Events are handled by background tasks. Lifecycle events are queued and
/// handled one after another, moving the worker through its states; an
/// activate sent while install is running waits for it. Fetch events are
/// spawned so no request waits on another, or on a lifecycle step.
pub struct WorkerHost {
  tx: mpsc::UnboundedSender<Envelope>,
  state: watch::Receiver<WorkerState>,
}

impl WorkerHost {
  /// Start the event loop.
  ///
  /// `network` serves fetches the worker does not intercept (before it is
  /// activated, or when no fetch handler is registered).
  pub fn spawn<F: Fetcher + 'static>(
    dispatcher: Dispatcher,
    network: Arc<F>,
    initial: WorkerState,
  ) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel::<Envelope>();
    let (state_tx, state_rx) = watch::channel(initial);
    let dispatcher = Arc::new(dispatcher);
    let state_tx = Arc::new(state_tx);

    // Lifecycle events run one at a time, in arrival order
    {
      let dispatcher = Arc::clone(&dispatcher);
      let state_tx = Arc::clone(&state_tx);
      tokio::spawn(async move {
        while let Some(Envelope { event, done }) = lifecycle_rx.recv().await {
          let result = run_lifecycle(&dispatcher, &state_tx, event).await;
          let _ = done.send(result);
        }
      });
    }

    tokio::spawn(async move {
      while let Some(Envelope { event, done }) = rx.recv().await {
        match event {
          Event::Fetch(request) => {
            let controlled = *state_tx.borrow() == WorkerState::Activated;
            let handler = if controlled {
              dispatcher.dispatch(Event::Fetch(request.clone()))
            } else {
              None
            };
            let network = Arc::clone(&network);

            tokio::spawn(async move {
              let result = match handler {
                Some(handling) => handling.await,
                None => passthrough(network.as_ref(), &request).await,
              };
              let _ = done.send(result);
            });
          }
          lifecycle => {
            if lifecycle_tx.send(Envelope { event: lifecycle, done }).is_err() {
              break;
            }
          }
        }
      }
      debug!("Worker event loop stopped");
    });

    Self {
      tx,
      state: state_rx,
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Deliver the install event and wait for it to complete.
  ///
  /// `None` means no install handler is registered; the step still succeeds.
  pub async fn install(&self) -> Result<Option<InstallReport>> {
    match self.send(Event::Install).await? {
      Outcome::Installed(report) => Ok(Some(report)),
      Outcome::Unhandled => Ok(None),
      other => Err(eyre!("Unexpected outcome for install: {:?}", other)),
    }
  }

  /// Deliver the activate event and wait for it to complete.
  pub async fn activate(&self) -> Result<Option<ActivateReport>> {
    match self.send(Event::Activate).await? {
      Outcome::Activated(report) => Ok(Some(report)),
      Outcome::Unhandled => Ok(None),
      other => Err(eyre!("Unexpected outcome for activate: {:?}", other)),
    }
  }

  /// Deliver a fetch event and wait for its response.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    match self.send(Event::Fetch(request)).await? {
      Outcome::Responded(served) => Ok(served),
      other => Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
    }
  }

  async fn send(&self, event: Event) -> Result<Outcome> {
    let (done, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, done })
      .map_err(|_| eyre!("Worker event loop has stopped"))?;

    rx.await
      .map_err(|_| eyre!("Worker dropped the event without completing it"))?
  }
}

/// Run one lifecycle event to completion, moving the worker through its states.
async fn run_lifecycle(
  dispatcher: &Dispatcher,
  state_tx: &watch::Sender<WorkerState>,
  event: Event,
) -> Result<Outcome> {
  let (from, during, success, failure) = match event {
    Event::Install => (
      WorkerState::Parsed,
      WorkerState::Installing,
      WorkerState::Installed,
      WorkerState::Redundant,
    ),
    _ => (
      WorkerState::Installed,
      WorkerState::Activating,
      WorkerState::Activated,
      WorkerState::Installed,
    ),
  };

  let state = *state_tx.borrow();
  if state != from {
    return Err(eyre!("Cannot {} while worker is {}", event.kind(), state));
  }

  state_tx.send_replace(during);
  let result = match dispatcher.dispatch(event) {
    Some(handling) => handling.await,
    None => Ok(Outcome::Unhandled),
  };

  match &result {
    Ok(_) => {
      info!(state = %success, "Lifecycle step complete");
      state_tx.send_replace(success);
    }
    Err(err) => {
      warn!(state = %failure, error = %err, "Lifecycle step failed");
      state_tx.send_replace(failure);
    }
  }

  result
}

/// Fetch straight from the network, bypassing the worker.
async fn passthrough<F: Fetcher>(network: &F, request: &Request) -> Result<Outcome> {
  let response = network.fetch(request).await?;
  Ok(Outcome::Responded(Served::from_network(response)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, ResponseSource, SqliteStorage};
  use crate::controller::CacheController;
  use crate::net::testing::ScriptedFetcher;
  use crate::routes::RouteTable;
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("https://conv.test").unwrap().join(path).unwrap()
  }

  fn host(
    storage: &Arc<SqliteStorage>,
    fetcher: ScriptedFetcher,
    initial: WorkerState,
  ) -> (WorkerHost, Arc<ScriptedFetcher>) {
    let fetcher = Arc::new(fetcher);
    let controller = CacheController::new(
      Arc::clone(storage),
      Arc::clone(&fetcher),
      "conv-1.0.0",
      vec![url("/"), url("/static/manifest.webmanifest")],
      RouteTable::default(),
    );
    let mut dispatcher = Dispatcher::new();
    controller.register(&mut dispatcher);
    (
      WorkerHost::spawn(dispatcher, Arc::clone(&fetcher), initial),
      fetcher,
    )
  }

  #[tokio::test]
  async fn test_full_lifecycle() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.open_bucket("conv-0.9.0").unwrap();
    let (host, fetcher) = host(&storage, ScriptedFetcher::new(), WorkerState::Parsed);

    let installed = host.install().await.unwrap().unwrap();
    assert_eq!(installed.stored.len(), 2);
    assert_eq!(host.state(), WorkerState::Installed);

    let activated = host.activate().await.unwrap().unwrap();
    assert_eq!(activated.deleted, vec!["conv-0.9.0"]);
    assert_eq!(host.state(), WorkerState::Activated);
    assert_eq!(storage.keys().unwrap(), vec!["conv-1.0.0"]);

    let before = fetcher.calls().len();
    let served = host
      .fetch(Request::get(url("/static/manifest.webmanifest")))
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(fetcher.calls().len(), before);
  }

  #[tokio::test]
  async fn test_activate_waits_for_running_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put_all("conv-0.9.0", &[]).unwrap();
    let (host, _) = host(&storage, ScriptedFetcher::new(), WorkerState::Parsed);

    let (installed, activated) = tokio::join!(host.install(), host.activate());
    assert_eq!(installed.unwrap().unwrap().stored.len(), 2);
    assert_eq!(activated.unwrap().unwrap().deleted, vec!["conv-0.9.0"]);
    assert_eq!(host.state(), WorkerState::Activated);
    assert_eq!(storage.keys().unwrap(), vec!["conv-1.0.0"]);
  }

  #[tokio::test]
  async fn test_activate_queued_behind_failed_install_is_rejected() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put_all("conv-0.9.0", &[]).unwrap();
    let fetcher = ScriptedFetcher::new().failing("https://conv.test/");
    let (host, _) = host(&storage, fetcher, WorkerState::Parsed);

    let (installed, activated) = tokio::join!(host.install(), host.activate());
    assert!(installed.is_err());
    assert!(activated.is_err());
    assert_eq!(host.state(), WorkerState::Redundant);
    assert!(storage.keys().unwrap().contains(&"conv-0.9.0".to_string()));
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (host, _) = host(&storage, ScriptedFetcher::new(), WorkerState::Parsed);

    assert!(host.activate().await.is_err());
    assert_eq!(host.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_failed_install_makes_worker_redundant() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = ScriptedFetcher::new().failing("https://conv.test/");
    let (host, _) = host(&storage, fetcher, WorkerState::Parsed);

    assert!(host.install().await.is_err());
    assert_eq!(host.state(), WorkerState::Redundant);
    assert!(host.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_before_activation_goes_to_network() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (installer, _) = host(&storage, ScriptedFetcher::new(), WorkerState::Parsed);
    installer.install().await.unwrap();

    // Resumed worker, installed but not controlling yet
    let (host, fetcher) = host(&storage, ScriptedFetcher::new(), WorkerState::Installed);
    let served = host.fetch(Request::get(url("/"))).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(fetcher.calls(), vec!["https://conv.test/"]);
  }

  #[tokio::test]
  async fn test_concurrent_fetches() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (host, _) = host(&storage, ScriptedFetcher::offline(), WorkerState::Activated);

    let (api, page) = tokio::join!(
      host.fetch(Request::get(url("/convertir?x=1"))),
      host.fetch(Request::get(url("/"))),
    );
    assert!(api.is_err());
    assert!(page.is_err());
  }

  #[tokio::test]
  async fn test_no_handlers_registered() {
    let host = WorkerHost::spawn(
      Dispatcher::new(),
      Arc::new(ScriptedFetcher::new()),
      WorkerState::Parsed,
    );

    assert!(host.install().await.unwrap().is_none());
    assert_eq!(host.state(), WorkerState::Installed);
    assert!(host.activate().await.unwrap().is_none());
    assert_eq!(host.state(), WorkerState::Activated);
    let served = host.fetch(Request::get(url("/"))).await;
    assert_eq!(served.unwrap().source, ResponseSource::Network);
  }
}
