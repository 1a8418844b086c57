//! Network side of the cache: request descriptors and the fetch seam.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::Method;
use url::Url;

use crate::cache::{RequestKey, StoredResponse};

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
    }
  }

  /// Key this request would be stored under, if it is cacheable at all.
  pub fn cache_key(&self) -> Option<RequestKey> {
    if self.method == Method::GET {
      Some(RequestKey::for_url(&self.url))
    } else {
      None
    }
  }
}

/// Anything that can perform a network fetch.
///
/// A returned `Ok` means the request got a response, whatever its status.
/// `Err` is a transport failure (offline, DNS, connection reset, ...).
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<StoredResponse>>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("conv-cache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<StoredResponse>> {
    async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let url = response.url().to_string();
      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      Ok(StoredResponse {
        url,
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_get_is_cacheable() {
    let url = Url::parse("https://conv.test/convertir").unwrap();
    let mut request = Request::get(url);
    assert!(request.cache_key().is_some());

    request.method = Method::POST;
    assert!(request.cache_key().is_none());
  }

  #[tokio::test]
  async fn test_scripted_fetcher_records_calls() {
    let fetcher = testing::ScriptedFetcher::new().failing("https://conv.test/down");
    let ok = Request::get(Url::parse("https://conv.test/up").unwrap());
    let down = Request::get(Url::parse("https://conv.test/down").unwrap());

    assert_eq!(fetcher.fetch(&ok).await.unwrap().status, 200);
    assert!(fetcher.fetch(&down).await.is_err());
    assert_eq!(
      fetcher.calls(),
      vec!["https://conv.test/up", "https://conv.test/down"]
    );
  }
}
