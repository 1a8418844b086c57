//! Dispatch table mapping event kinds to their handlers.

use color_eyre::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;

use crate::cache::Served;
use crate::controller::{ActivateReport, InstallReport};
use crate::net::Request;

/// An event delivered by the host.
#[derive(Debug, Clone)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Event::Install => EventKind::Install,
      Event::Activate => EventKind::Activate,
      Event::Fetch(_) => EventKind::Fetch,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
}

impl std::fmt::Display for EventKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventKind::Install => write!(f, "install"),
      EventKind::Activate => write!(f, "activate"),
      EventKind::Fetch => write!(f, "fetch"),
    }
  }
}

/// What a handler produced once its work finished.
#[derive(Debug)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Responded(Served),
  /// No handler was registered for a lifecycle event
  Unhandled,
}

type Handler = Box<dyn Fn(Event) -> BoxFuture<'static, Result<Outcome>> + Send + Sync>;

/// Handlers keyed by event kind. At most one handler per kind.
#[derive(Default)]
pub struct Dispatcher {
  handlers: HashMap<EventKind, Handler>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the handler for `kind`, replacing any previous one.
  pub fn on<H, Fut>(&mut self, kind: EventKind, handler: H)
  where
    H: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
  {
    self
      .handlers
      .insert(kind, Box::new(move |event| handler(event).boxed()));
  }

  /// Start handling `event`.
  ///
  /// The returned future is the event's completion signal. `None` means no
  /// handler is registered for this kind of event.
  pub fn dispatch(&self, event: Event) -> Option<BoxFuture<'static, Result<Outcome>>> {
    let handler = self.handlers.get(&event.kind())?;
    Some(handler(event))
  }
}
