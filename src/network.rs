//! Network port and its reqwest-backed implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::http::{Headers, Request, Response};

/// Why a fetch produced no response at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// DNS, connect, reset, or any other transport-level failure
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out")]
  Timeout,
  /// The request could not be built or sent as given
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl FetchError {
  /// Connectivity failures are the ones the engine recovers from locally.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Unreachable(_) | Self::Timeout)
  }
}

/// Anything that can turn a request into a response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Headers that belong to a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "host",
  "connection",
  "content-length",
  "transfer-encoding",
  "keep-alive",
  "upgrade",
  "proxy-connection",
  "te",
  "trailer",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// HTTP network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::Invalid(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(classify)?;

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
      }
    }
    let body = response.bytes().await.map_err(classify)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn classify(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else if err.is_builder() {
    FetchError::Invalid(err.to_string())
  } else {
    FetchError::Unreachable(err.to_string())
  }
}
