//! Ordered routing rules deciding how each intercepted request is served.

use serde::Deserialize;
use url::Url;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Network, falling back to the cache when the network fails
  NetworkFirst,
  /// Cache, falling back to the network on a miss
  CacheFirst,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::CacheFirst => write!(f, "cache-first"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
  /// Full URL contains the pattern
  Contains,
  /// URL path starts with the pattern
  Prefix,
}

/// A single (predicate, strategy) rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
  #[serde(rename = "match")]
  pub kind: MatchKind,
  pub pattern: String,
  pub strategy: Strategy,
}

impl Route {
  pub fn contains(pattern: &str, strategy: Strategy) -> Self {
    Self {
      kind: MatchKind::Contains,
      pattern: pattern.to_string(),
      strategy,
    }
  }

  pub fn prefix(pattern: &str, strategy: Strategy) -> Self {
    Self {
      kind: MatchKind::Prefix,
      pattern: pattern.to_string(),
      strategy,
    }
  }

  pub fn matches(&self, url: &Url) -> bool {
    match self.kind {
      MatchKind::Contains => url.as_str().contains(&self.pattern),
      MatchKind::Prefix => url.path().starts_with(&self.pattern),
    }
  }
}

/// Ordered rule list, evaluated first-match-wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
  routes: Vec<Route>,
  fallback: Strategy,
}

impl RouteTable {
  /// Build a table; requests matching no rule use `fallback`.
  pub fn new(routes: Vec<Route>, fallback: Strategy) -> Self {
    Self { routes, fallback }
  }

  pub fn strategy_for(&self, url: &Url) -> Strategy {
    self
      .routes
      .iter()
      .find(|route| route.matches(url))
      .map(|route| route.strategy)
      .unwrap_or(self.fallback)
  }

  pub fn routes(&self) -> &[Route] {
    &self.routes
  }
}

impl Default for RouteTable {
  /// Network-first for the conversion API, cache-first for everything else.
  fn default() -> Self {
    Self::new(
      vec![Route::contains("/convertir", Strategy::NetworkFirst)],
      Strategy::CacheFirst,
    )
  }
}
