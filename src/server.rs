//! HTTP relay in front of the web app and its data API.
//!
//! Every request that is not one of the `/__offline/*` control endpoints is
//! mapped to its upstream URL and handed to the engine.

use axum::{
  body::{Body, Bytes},
  extract::State,
  http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
  response::{
    sse::{Event, KeepAlive, Sse},
    IntoResponse,
  },
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::engine::InterceptError;
use crate::http::{Headers, Method, Request, Response};
use crate::lifecycle::{Lifecycle, LifecycleState, TriggerHandle};
use crate::network::{is_hop_by_hop, Network};
use crate::notify::BroadcastNotifier;

/// Where incoming paths are forwarded.
#[derive(Debug, Clone)]
pub struct Upstream {
  site: Url,
  api: Url,
  api_prefixes: Vec<String>,
  api_key: Option<String>,
}

impl Upstream {
  pub fn new(site: Url, api: Url, api_prefixes: Vec<String>, api_key: Option<String>) -> Self {
    Self {
      site,
      api,
      api_prefixes,
      api_key,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::new(
      config.upstream.clone(),
      config.api.origin.clone(),
      config.api.path_prefixes.clone(),
      Config::get_api_key(),
    )
  }

  fn is_api_path(&self, path: &str) -> bool {
    self.api_prefixes.iter().any(|prefix| {
      let prefix = prefix.trim_end_matches('/');
      path == prefix || path.starts_with(&format!("{}/", prefix))
    })
  }

  /// Build the engine request for an incoming one.
  pub fn request(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Result<Request> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let is_api = self.is_api_path(uri.path());
    let base = if is_api { &self.api } else { &self.site };
    let url = base
      .join(path_and_query)
      .map_err(|e| eyre!("Failed to map {} onto {}: {}", path_and_query, base, e))?;

    let mut forwarded = Headers::new();
    for (name, value) in headers {
      if is_hop_by_hop(name.as_str()) {
        continue;
      }
      if let Ok(value) = value.to_str() {
        forwarded.insert(name.as_str().to_ascii_lowercase(), value.to_string());
      }
    }

    if is_api {
      if let Some(key) = &self.api_key {
        forwarded
          .entry("apikey".to_string())
          .or_insert_with(|| key.clone());
        forwarded
          .entry("authorization".to_string())
          .or_insert_with(|| format!("Bearer {}", key));
      }
    }

    let mut request = Request::new(method, url).with_body(body.to_vec());
    request.headers = forwarded;
    Ok(request)
  }
}

/// Shared state of the relay server.
pub struct RelayState<N: Network, S: CacheStorage> {
  lifecycle: Arc<Lifecycle<N, S>>,
  triggers: TriggerHandle,
  events: BroadcastNotifier,
  upstream: Arc<Upstream>,
}

impl<N: Network, S: CacheStorage> Clone for RelayState<N, S> {
  fn clone(&self) -> Self {
    Self {
      lifecycle: Arc::clone(&self.lifecycle),
      triggers: self.triggers.clone(),
      events: self.events.clone(),
      upstream: Arc::clone(&self.upstream),
    }
  }
}

impl<N: Network, S: CacheStorage> RelayState<N, S> {
  pub fn new(
    lifecycle: Arc<Lifecycle<N, S>>,
    triggers: TriggerHandle,
    events: BroadcastNotifier,
    upstream: Upstream,
  ) -> Self {
    Self {
      lifecycle,
      triggers,
      events,
      upstream: Arc::new(upstream),
    }
  }
}

/// Error body returned by the relay itself.
#[derive(Debug)]
struct RelayError {
  status: StatusCode,
  message: String,
}

impl RelayError {
  fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }
}

impl IntoResponse for RelayError {
  fn into_response(self) -> axum::response::Response {
    (self.status, Json(json!({ "error": self.message }))).into_response()
  }
}

impl From<InterceptError> for RelayError {
  fn from(err: InterceptError) -> Self {
    let status = match &err {
      InterceptError::MalformedBody(_) => StatusCode::BAD_REQUEST,
      _ => StatusCode::BAD_GATEWAY,
    };
    Self::new(status, err.to_string())
  }
}

#[derive(Debug, Serialize)]
struct StatusReport {
  state: LifecycleState,
  version: String,
  controlling: bool,
  namespaces: Vec<String>,
  queue_size: usize,
  dead_letters: usize,
}

pub fn router<N, S>(state: RelayState<N, S>) -> Router
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  Router::new()
    .route("/__offline/status", get(status::<N, S>))
    .route("/__offline/sync", post(sync::<N, S>))
    .route("/__offline/events", get(events::<N, S>))
    .fallback(relay::<N, S>)
    .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve<N, S>(listen: SocketAddr, state: RelayState<N, S>) -> Result<()>
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, "Relay listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("Failed to listen for Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

async fn status<N: Network, S: CacheStorage>(
  State(state): State<RelayState<N, S>>,
) -> Result<Json<StatusReport>, RelayError> {
  let internal = |e: color_eyre::Report| RelayError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
  let engine = state.lifecycle.engine();

  Ok(Json(StatusReport {
    state: state.lifecycle.state(),
    version: state.lifecycle.version().to_string(),
    controlling: engine.is_controlling(),
    namespaces: engine.storage().namespaces().map_err(internal)?,
    queue_size: engine.queue().len().map_err(internal)?,
    dead_letters: engine.queue().dead_letters().map_err(internal)?.len(),
  }))
}

async fn sync<N: Network, S: CacheStorage>(State(state): State<RelayState<N, S>>) -> impl IntoResponse {
  state.triggers.connectivity_restored();
  (StatusCode::ACCEPTED, Json(json!({ "triggered": true })))
}

async fn events<N: Network, S: CacheStorage>(
  State(state): State<RelayState<N, S>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let rx = state.events.subscribe();
  let stream = stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(event) => {
          let sse = Event::default()
            .event(event.kind())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event"));
          return Some((Ok::<_, Infallible>(sse), rx));
        }
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event subscriber lagged"),
        Err(RecvError::Closed) => return None,
      }
    }
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn relay<N: Network, S: CacheStorage>(
  State(state): State<RelayState<N, S>>,
  method: axum::http::Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Result<axum::response::Response, RelayError> {
  let method = Method::parse(method.as_str()).ok_or_else(|| {
    RelayError::new(StatusCode::METHOD_NOT_ALLOWED, format!("Unsupported method {}", method))
  })?;
  let request = state
    .upstream
    .request(method, &uri, &headers, body)
    .map_err(|e| RelayError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

  let result = state.lifecycle.engine().handle(request).await?;
  Ok(to_http_response(result.into_response()))
}

fn to_http_response(response: Response) -> axum::response::Response {
  let mut out = axum::response::Response::new(Body::from(response.body));
  *out.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      out.headers_mut().append(name, value);
    }
  }
  out
}
