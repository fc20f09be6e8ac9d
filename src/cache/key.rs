//! Request identity used as the cache key.

use sha2::{Digest, Sha256};

use crate::http::{Method, Request};

/// Stable, fixed-length key derived from method + URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn for_request(request: &Request) -> Self {
    Self::from_parts(request.method, request.url.as_str())
  }

  pub fn from_parts(method: Method, url: &str) -> Self {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}
