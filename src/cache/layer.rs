//! Cache layer that orchestrates caching policy with network fetching.

use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, warn};

use super::key::RequestKey;
use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::{Request, Response};
use crate::network::FetchError;

/// Cache layer bound to one namespace.
///
/// Storage failures inside the policies are logged and treated as misses so a
/// broken cache never turns a good network response into an error.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  namespace: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend and namespace.
  pub fn new(storage: Arc<S>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Store a copy of `response` under the request's identity.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    let key = RequestKey::for_request(request);
    self
      .storage
      .put(&self.namespace, &key, request.url.as_str(), response)
  }

  /// Exact-match lookup by request identity.
  pub fn lookup(&self, request: &Request) -> Result<Option<CacheResult<Response>>> {
    let key = RequestKey::for_request(request);
    Ok(
      self
        .storage
        .lookup(&self.namespace, &key)?
        .map(|entry| CacheResult::from_cache(entry.response, entry.cached_at)),
    )
  }

  /// Store a 200 response, logging instead of failing.
  fn store_ok(&self, request: &Request, response: &Response) {
    if response.status != 200 {
      return;
    }
    if let Err(e) = self.put(request, response) {
      warn!(namespace = %self.namespace, url = %request.url, "Failed to cache response: {}", e);
    }
  }

  /// Lookup that degrades to a miss on storage failure.
  fn lookup_or_miss(&self, request: &Request) -> Option<CacheResult<Response>> {
    match self.lookup(request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(namespace = %self.namespace, url = %request.url, "Cache lookup failed: {}", e);
        None
      }
    }
  }

  /// Cache-first fetch.
  ///
  /// 1. Check cache - on a hit, return it without touching the network
  /// 2. On a miss, fetch from network
  /// 3. Store 200 responses before returning them
  pub async fn cache_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    if let Some(hit) = self.lookup_or_miss(request) {
      debug!(url = %request.url, "Cache hit");
      return Ok(hit);
    }

    let response = fetcher().await?;
    self.store_ok(request, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Network-first fetch.
  ///
  /// 1. Fetch from network and store 200 responses
  /// 2. On a connectivity failure, return the cached entry if there is one
  /// 3. Otherwise return the network error
  pub async fn network_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store_ok(request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) if err.is_connectivity() => match self.lookup_or_miss(request) {
        Some(hit) => {
          debug!(url = %request.url, "Network failed, serving cached copy");
          Ok(hit)
        }
        None => Err(err),
      },
      Err(err) => Err(err),
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      namespace: self.namespace.clone(),
    }
  }
}
