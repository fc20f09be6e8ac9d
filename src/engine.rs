//! Request interception engine.
//!
//! Every outgoing request passes through [`Interceptor::handle`], which picks
//! a policy by request kind:
//!
//! - API reads: network, then the API response cache, then the entity snapshot
//! - API writes: network, then (on connectivity loss) snapshot mutation +
//!   offline queue + synthesized acknowledgment
//! - Documents: network-first with the offline shell as last resort
//! - Other assets: cache-first, with an empty success for images

use color_eyre::Report;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Namespaces};
use crate::http::{Destination, Method, Request, Response};
use crate::network::{FetchError, Network};
use crate::notify::{ClientEvent, Notifier};
use crate::queue::{MutationQueue, QueuedMutation};
use crate::replay::{ReplayOutcome, Replayer};
use crate::routes::RouteTable;
use crate::snapshot::{Change, MalformedBody, SnapshotStore};

/// Everything the engine needs to know about the application it fronts.
#[derive(Debug, Clone)]
pub struct EngineSettings {
  pub namespaces: Namespaces,
  pub routes: RouteTable,
  /// Hosts (or host suffixes) of the data API
  pub api_hosts: Vec<String>,
  /// Document served for navigations when nothing else is available
  pub offline_shell: Option<Url>,
  /// Replay attempts before an entry is dead-lettered; `None` retries forever
  pub max_replay_attempts: Option<u32>,
}

/// Why a request could not be satisfied.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
  #[error(transparent)]
  Fetch(#[from] FetchError),
  /// Offline, and nothing cached or snapshotted can stand in
  #[error("no offline fallback for {url}: {cause}")]
  NoFallback { url: String, cause: FetchError },
  #[error(transparent)]
  MalformedBody(#[from] MalformedBody),
  #[error("storage error: {0}")]
  Storage(Report),
}

impl From<Report> for InterceptError {
  fn from(report: Report) -> Self {
    Self::Storage(report)
  }
}

/// How a request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Api,
  Document,
  Asset,
}

/// The offline engine. Owns the caches, the queue and the snapshots.
pub struct Interceptor<N: Network, S: CacheStorage> {
  network: Arc<N>,
  storage: Arc<S>,
  namespaces: Namespaces,
  routes: Arc<RouteTable>,
  api_hosts: Vec<String>,
  offline_shell: Option<Url>,
  static_cache: CacheLayer<S>,
  api_cache: CacheLayer<S>,
  queue: MutationQueue<S>,
  snapshot: SnapshotStore<S>,
  notifier: Arc<dyn Notifier>,
  replayer: Replayer<N, S>,
  /// Set once the lifecycle manager has claimed this engine
  controlled: AtomicBool,
}

impl<N: Network, S: CacheStorage> Interceptor<N, S> {
  pub fn new(
    network: Arc<N>,
    storage: Arc<S>,
    settings: EngineSettings,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    let EngineSettings {
      namespaces,
      routes,
      api_hosts,
      offline_shell,
      max_replay_attempts,
    } = settings;
    let routes = Arc::new(routes);

    let replayer = Replayer::new(
      Arc::clone(&network),
      MutationQueue::new(Arc::clone(&storage), namespaces.api.clone()),
      SnapshotStore::new(Arc::clone(&storage), namespaces.api.clone()),
      Arc::clone(&routes),
      Arc::clone(&notifier),
      max_replay_attempts,
    );

    Self {
      static_cache: CacheLayer::new(Arc::clone(&storage), namespaces.static_assets.clone()),
      api_cache: CacheLayer::new(Arc::clone(&storage), namespaces.api.clone()),
      queue: MutationQueue::new(Arc::clone(&storage), namespaces.api.clone()),
      snapshot: SnapshotStore::new(Arc::clone(&storage), namespaces.api.clone()),
      network,
      storage,
      namespaces,
      routes,
      api_hosts,
      offline_shell,
      notifier,
      replayer,
      controlled: AtomicBool::new(false),
    }
  }

  /// Start applying offline policies to requests.
  pub fn claim(&self) {
    self.controlled.store(true, Ordering::SeqCst);
  }

  pub fn is_controlling(&self) -> bool {
    self.controlled.load(Ordering::SeqCst)
  }

  pub fn namespaces(&self) -> &Namespaces {
    &self.namespaces
  }

  pub fn routes(&self) -> &RouteTable {
    &self.routes
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub fn queue(&self) -> &MutationQueue<S> {
    &self.queue
  }

  pub fn snapshot(&self) -> &SnapshotStore<S> {
    &self.snapshot
  }

  /// Run one replay pass over the offline queue.
  pub async fn replay(&self) -> color_eyre::Result<ReplayOutcome> {
    self.replayer.replay().await
  }

  pub fn classify(&self, request: &Request) -> RequestKind {
    let is_api = request.url.host_str().is_some_and(|host| {
      self
        .api_hosts
        .iter()
        .any(|api| host == api || host.ends_with(&format!(".{}", api)))
    });

    if is_api {
      RequestKind::Api
    } else if request.destination() == Destination::Document {
      RequestKind::Document
    } else {
      RequestKind::Asset
    }
  }

  /// Satisfy one request.
  pub async fn handle(&self, request: Request) -> Result<CacheResult<Response>, InterceptError> {
    if !self.is_controlling() {
      return Ok(CacheResult::from_network(self.network.fetch(&request).await?));
    }

    let kind = self.classify(&request);
    debug!(method = %request.method, url = %request.url, ?kind, "Intercepted request");

    match kind {
      RequestKind::Api => match request.method {
        Method::Get => self.handle_api_read(request).await,
        method if method.is_write() => self.handle_api_write(request).await,
        _ => Ok(CacheResult::from_network(self.network.fetch(&request).await?)),
      },
      RequestKind::Document => self.handle_document(request).await,
      RequestKind::Asset => self.handle_asset(request).await,
    }
  }

  async fn handle_api_read(&self, request: Request) -> Result<CacheResult<Response>, InterceptError> {
    match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember_read(&request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) if err.is_connectivity() => {
        debug!(url = %request.url, "Network failed, trying offline mode");

        match self.api_cache.lookup(&request) {
          Ok(Some(hit)) => return Ok(hit),
          Ok(None) => {}
          Err(e) => warn!(url = %request.url, "API cache lookup failed: {}", e),
        }

        let Some(matched) = self.routes.match_url(&request.url) else {
          return Err(no_fallback(&request, err));
        };
        let items = self
          .snapshot
          .select(matched.route, matched.target_id.as_deref())?;
        Ok(CacheResult::from_snapshot(Response::json(200, &Value::Array(items))))
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Cache a successful read and refresh the collection snapshot from it.
  fn remember_read(&self, request: &Request, response: &Response) {
    if let Err(e) = self.api_cache.put(request, response) {
      warn!(url = %request.url, "Failed to cache API response: {}", e);
    }

    let Some(matched) = self.routes.match_url(&request.url) else {
      return;
    };
    // A filtered read only sees part of the collection
    if matched.target_id.is_some() {
      return;
    }
    if let Some(Value::Array(items)) = response.body_json() {
      if let Err(e) = self.snapshot.replace(matched.route, items) {
        warn!(collection = %matched.route.name, "Failed to refresh snapshot: {}", e);
      }
    }
  }

  async fn handle_api_write(&self, request: Request) -> Result<CacheResult<Response>, InterceptError> {
    match self.network.fetch(&request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(err) if err.is_connectivity() => self.accept_offline(&request, &err),
      Err(err) => Err(err.into()),
    }
  }

  /// Apply a write locally, queue it for replay and acknowledge it.
  fn accept_offline(
    &self,
    request: &Request,
    cause: &FetchError,
  ) -> Result<CacheResult<Response>, InterceptError> {
    let (local_ids, touched) = match self.routes.match_url(&request.url) {
      Some(matched) => {
        let change = Change::from_request(request, &matched)?;
        self.snapshot.apply(matched.route, &change)?;
        let id_field = &matched.route.id_field;
        (change.inserted_ids(id_field), change.touched_ids(id_field))
      }
      None => (Vec::new(), Vec::new()),
    };

    let queue_size = self
      .queue
      .append(QueuedMutation::capture(request, local_ids))?;
    info!(
      method = %request.method,
      url = %request.url,
      queue_size,
      "Queued write while offline: {}",
      cause
    );
    self.notifier.notify(ClientEvent::QueueUpdated { queue_size });

    let body = json!({ "success": true, "offline": true, "ids": touched });
    Ok(CacheResult::offline_ack(Response::json(200, &body)))
  }

  async fn handle_document(&self, request: Request) -> Result<CacheResult<Response>, InterceptError> {
    let result = self
      .static_cache
      .network_first(&request, || self.network.fetch(&request))
      .await;

    match result {
      Ok(result) => Ok(result),
      Err(err) if err.is_connectivity() => {
        let shell = self
          .offline_shell
          .as_ref()
          .map(|url| Request::get(url.clone()))
          .and_then(|shell| match self.static_cache.lookup(&shell) {
            Ok(hit) => hit,
            Err(e) => {
              warn!("Offline shell lookup failed: {}", e);
              None
            }
          });

        match shell {
          Some(hit) => Ok(CacheResult::fallback(hit.data)),
          None => Err(no_fallback(&request, err)),
        }
      }
      Err(err) => Err(err.into()),
    }
  }

  async fn handle_asset(&self, request: Request) -> Result<CacheResult<Response>, InterceptError> {
    let result = self
      .static_cache
      .cache_first(&request, || self.network.fetch(&request))
      .await;

    match result {
      Ok(result) => Ok(result),
      Err(_) if request.destination() == Destination::Image => {
        Ok(CacheResult::fallback(Response::empty_ok()))
      }
      Err(err) => Err(err.into()),
    }
  }
}

fn no_fallback(request: &Request, cause: FetchError) -> InterceptError {
  InterceptError::NoFallback {
    url: request.url.to_string(),
    cause,
  }
}
