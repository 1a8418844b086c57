//! Core types for cached requests and responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A response as stored in a cache bucket.
///
/// Bodies are kept fully buffered; the assets this cache deals with are small
/// static files and short API replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  /// Final URL of the response
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A response read back from a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: StoredResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Key under which a request is stored in a bucket.
///
/// Matching follows cache-match rules: the fragment is not part of the key,
/// and only GET requests can be matched at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  url: String,
}

impl RequestKey {
  /// Build the key for a GET of `url`.
  pub fn for_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      url: url.to_string(),
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Fixed-length storage hash of the key.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Result of an intercepted fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: StoredResponse,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: StoredResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Cache,
      cached_at: Some(cached.cached_at),
    }
  }

  /// Cached response served because the network failed.
  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: ResponseSource::Offline,
      cached_at: Some(cached.cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Cache hit under cache-first
  Cache,
  /// Network failed under network-first, served from cache
  Offline,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResponseSource::Network => write!(f, "network"),
      ResponseSource::Cache => write!(f, "cache"),
      ResponseSource::Offline => write!(f, "offline"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::for_url(&Url::parse("https://conv.test/static/app.css#top").unwrap());
    let b = RequestKey::for_url(&Url::parse("https://conv.test/static/app.css").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
  }

  #[test]
  fn test_key_keeps_query() {
    let a = RequestKey::for_url(&Url::parse("https://conv.test/convertir?x=1").unwrap());
    let b = RequestKey::for_url(&Url::parse("https://conv.test/convertir?x=2").unwrap());
    assert_ne!(a.hash(), b.hash());
    assert_eq!(a.hash().len(), 64);
  }

  #[test]
  fn test_is_ok() {
    let mut response = StoredResponse {
      url: "https://conv.test/".to_string(),
      status: 204,
      headers: Vec::new(),
      body: Vec::new(),
    };
    assert!(response.is_ok());
    response.status = 404;
    assert!(!response.is_ok());
  }
}
