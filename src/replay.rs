//! Replay of the offline queue once connectivity returns.

use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStorage;
use crate::http::Response;
use crate::network::{FetchError, Network};
use crate::notify::{ClientEvent, Notifier};
use crate::queue::{MutationQueue, QueuedMutation};
use crate::routes::RouteTable;
use crate::snapshot::{entity_id, SnapshotStore};

/// Why a replay pass stopped before the end of the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
  /// Still offline, or the server did not answer
  Unreachable(FetchError),
  /// The server refused the write (4xx)
  Rejected { status: u16 },
  /// Any other non-success status
  ServerError { status: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
  pub synced: usize,
  pub remaining: usize,
  pub halted: Option<Halt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
  /// Nothing was queued
  Empty,
  /// Another pass holds the guard
  AlreadyRunning,
  Finished(ReplayReport),
}

enum Step {
  Next,
  Halt(Halt),
}

/// Held for the duration of one pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Drains the offline queue in FIFO order, halting on the first failure.
pub struct Replayer<N: Network, S: CacheStorage> {
  network: Arc<N>,
  queue: MutationQueue<S>,
  snapshot: SnapshotStore<S>,
  routes: Arc<RouteTable>,
  notifier: Arc<dyn Notifier>,
  max_attempts: Option<u32>,
  running: AtomicBool,
}

impl<N: Network, S: CacheStorage> Replayer<N, S> {
  pub fn new(
    network: Arc<N>,
    queue: MutationQueue<S>,
    snapshot: SnapshotStore<S>,
    routes: Arc<RouteTable>,
    notifier: Arc<dyn Notifier>,
    max_attempts: Option<u32>,
  ) -> Self {
    Self {
      network,
      queue,
      snapshot,
      routes,
      notifier,
      max_attempts,
      running: AtomicBool::new(false),
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  /// Run one pass over the queue.
  pub async fn replay(&self) -> Result<ReplayOutcome> {
    let Some(_guard) = PassGuard::acquire(&self.running) else {
      debug!("Replay already in progress");
      return Ok(ReplayOutcome::AlreadyRunning);
    };

    let mut pending = self.queue.load()?;
    if pending.is_empty() {
      return Ok(ReplayOutcome::Empty);
    }
    info!(queued = pending.len(), "Replaying offline queue");

    let mut processed = Vec::new();
    let mut halted = None;
    let mut failure = None;

    for index in 0..pending.len() {
      match self.submit(&mut pending, index, &mut processed).await {
        Ok(Step::Next) => {}
        Ok(Step::Halt(halt)) => {
          halted = Some(halt);
          break;
        }
        Err(e) => {
          error!("Replay stopped by a storage error: {}", e);
          failure = Some(e);
          break;
        }
      }
    }

    // Writes the server accepted leave the queue even if the pass failed
    let remaining = if processed.is_empty() {
      self.queue.len()
    } else {
      self.queue.remove(&processed)
    };
    let synced = processed.len();

    if let (true, Ok(remaining)) = (synced > 0, &remaining) {
      info!(synced, remaining, "Offline sync completed");
      self.notifier.notify(ClientEvent::SyncCompleted {
        synced_count: synced,
        remaining_count: *remaining,
      });
    }

    if let Some(e) = failure {
      return Err(e);
    }
    Ok(ReplayOutcome::Finished(ReplayReport {
      synced,
      remaining: remaining?,
      halted,
    }))
  }

  /// Submit `pending[index]`. Successful ids are pushed to `processed`.
  async fn submit(
    &self,
    pending: &mut [QueuedMutation],
    index: usize,
    processed: &mut Vec<String>,
  ) -> Result<Step> {
    let mutation = pending[index].clone();
    let request = match mutation.to_request() {
      Ok(request) => request,
      Err(e) => {
        // Can never be submitted; set it aside and keep going
        warn!(id = %mutation.id, "Dead-lettering unreadable queue entry: {}", e);
        self.queue.dead_letter(&mutation.id)?;
        self.notifier.notify(ClientEvent::DeadLettered {
          url: mutation.url.clone(),
          attempts: mutation.attempts,
        });
        return Ok(Step::Next);
      }
    };

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        debug!(method = %mutation.method, url = %mutation.url, "Replayed queued write");
        processed.push(mutation.id.clone());
        for (local, remote) in self.reconcile(&mutation, &response)? {
          for later in pending[index + 1..].iter_mut() {
            later.rewrite_id(&local, &remote);
          }
        }
        Ok(Step::Next)
      }
      Ok(response) => {
        let status = response.status;
        warn!(url = %mutation.url, status, "Replay halted by server response");
        let halt = if response.is_client_error() {
          self.flag_rejected(&mutation)?;
          self.notifier.notify(ClientEvent::ReplayRejected {
            url: mutation.url.clone(),
            status,
          });
          Halt::Rejected { status }
        } else {
          Halt::ServerError { status }
        };
        self.record_failure(&mutation)?;
        Ok(Step::Halt(halt))
      }
      Err(err) => {
        warn!(url = %mutation.url, "Replay halted: {}", err);
        self.record_failure(&mutation)?;
        Ok(Step::Halt(Halt::Unreachable(err)))
      }
    }
  }

  /// Swap local ids for the ones the server assigned, if the response says.
  ///
  /// Returns the `(local, remote)` pairs that were applied.
  fn reconcile(&self, mutation: &QueuedMutation, response: &Response) -> Result<Vec<(String, Value)>> {
    if mutation.local_ids.is_empty() {
      return Ok(Vec::new());
    }
    let Ok(url) = url::Url::parse(&mutation.url) else {
      return Ok(Vec::new());
    };
    let Some(matched) = self.routes.match_url(&url) else {
      return Ok(Vec::new());
    };

    let created = match response.body_json() {
      Some(Value::Array(items)) => items,
      Some(obj @ Value::Object(_)) => vec![obj],
      _ => return Ok(Vec::new()),
    };

    let id_field = &matched.route.id_field;
    let pairs: Vec<(String, Value)> = mutation
      .local_ids
      .iter()
      .zip(created.iter())
      .filter_map(|(local, entity)| {
        let remote = entity_id(entity, id_field)?;
        (remote != *local).then(|| (local.clone(), entity[id_field.as_str()].clone()))
      })
      .collect();

    if pairs.is_empty() {
      return Ok(pairs);
    }

    self.snapshot.remap_ids(matched.route, &pairs)?;
    for (local, remote) in &pairs {
      let rewritten = self.queue.rewrite_local_id(local, remote)?;
      debug!(%local, %remote, rewritten, "Reconciled offline id");
    }
    Ok(pairs)
  }

  fn flag_rejected(&self, mutation: &QueuedMutation) -> Result<()> {
    let Ok(url) = url::Url::parse(&mutation.url) else {
      return Ok(());
    };
    let Some(matched) = self.routes.match_url(&url) else {
      return Ok(());
    };

    let mut ids = mutation.local_ids.clone();
    ids.extend(matched.target_id.clone());
    let flagged = self.snapshot.flag_conflict(matched.route, &ids)?;
    debug!(collection = %matched.route.name, flagged, "Flagged rejected entities");
    Ok(())
  }

  fn record_failure(&self, mutation: &QueuedMutation) -> Result<()> {
    let attempts = self.queue.record_failure(&mutation.id)?;
    let Some(max) = self.max_attempts else {
      return Ok(());
    };

    if attempts >= max {
      warn!(url = %mutation.url, attempts, "Giving up on queued write");
      self.queue.dead_letter(&mutation.id)?;
      self.notifier.notify(ClientEvent::DeadLettered {
        url: mutation.url.clone(),
        attempts,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedEntry, MemoryStorage, RequestKey};
  use crate::engine::Interceptor;
  use crate::http::{Method, Request};
  use crate::snapshot::{OFFLINE_CONFLICT_FIELD, OFFLINE_CREATED_FIELD};
  use crate::testing::{api_url, engine, engine_with, settings, MockNetwork, TestEngine};
  use serde_json::json;
  use std::sync::Mutex;

  fn todos() -> String {
    api_url("/rest/v1/todos").to_string()
  }

  async fn create(engine: &TestEngine, title: &str) -> String {
    let request = Request::new(Method::Post, api_url("/rest/v1/todos")).with_json(&json!({ "title": title }));
    let ack = engine.handle(request).await.unwrap();
    ack.data.body_json().unwrap()["ids"][0].as_str().unwrap().to_string()
  }

  fn finished(outcome: ReplayOutcome) -> ReplayReport {
    match outcome {
      ReplayOutcome::Finished(report) => report,
      other => panic!("expected a finished pass, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_empty_queue_submits_nothing() {
    let network = Arc::new(MockNetwork::online());
    let (engine, notifier) = engine(network.clone());

    assert_eq!(engine.replay().await.unwrap(), ReplayOutcome::Empty);
    assert!(network.requests().is_empty());
    assert!(notifier.events().is_empty());
  }

  #[tokio::test]
  async fn test_replay_submits_in_fifo_order() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, notifier) = engine(network.clone());
    for title in ["a", "b", "c"] {
      create(&engine, title).await;
    }
    let queued: Vec<String> = engine
      .queue()
      .load()
      .unwrap()
      .iter()
      .map(|m| m.body.clone())
      .collect();

    network.set_online(true);
    network.clear_log();
    network.respond(Method::Post, &todos(), Response::new(201, ""));
    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report, ReplayReport { synced: 3, remaining: 0, halted: None });
    assert_eq!(network.requests(), vec![format!("POST {}", todos()); 3]);
    assert!(queued[0].contains("\"a\"") && queued[2].contains("\"c\""));
    assert!(engine.queue().is_empty().unwrap());
    assert_eq!(
      notifier.events().last(),
      Some(&ClientEvent::SyncCompleted { synced_count: 3, remaining_count: 0 })
    );
  }

  #[tokio::test]
  async fn test_replay_halts_on_first_unreachable() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, _) = engine(network.clone());
    create(&engine, "a").await;
    create(&engine, "b").await;
    create(&engine, "c").await;
    let ids: Vec<String> = engine.queue().load().unwrap().iter().map(|m| m.id.clone()).collect();

    network.set_online(true);
    network.clear_log();
    network.respond_once(Method::Post, &todos(), Ok(Response::new(201, "")));
    network.respond_once(Method::Post, &todos(), Err(FetchError::Timeout));
    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report.synced, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(report.halted, Some(Halt::Unreachable(FetchError::Timeout)));
    assert_eq!(network.requests().len(), 2);

    let left = engine.queue().load().unwrap();
    assert_eq!(left.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids[1..].to_vec());
    assert_eq!(left[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_server_error_keeps_entry_for_next_pass() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, notifier) = engine(network.clone());
    create(&engine, "a").await;

    network.set_online(true);
    network.respond_once(Method::Post, &todos(), Ok(Response::new(503, "busy")));
    let report = finished(engine.replay().await.unwrap());
    assert_eq!(report.halted, Some(Halt::ServerError { status: 503 }));
    assert_eq!(report.remaining, 1);
    assert_eq!(notifier.events().len(), 1);

    network.respond(Method::Post, &todos(), Response::new(201, ""));
    let report = finished(engine.replay().await.unwrap());
    assert_eq!(report, ReplayReport { synced: 1, remaining: 0, halted: None });
  }

  #[tokio::test]
  async fn test_rejected_write_is_flagged_and_kept() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, notifier) = engine(network.clone());
    let local = create(&engine, "a").await;

    network.set_online(true);
    network.respond(Method::Post, &todos(), Response::new(409, "duplicate"));
    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report.halted, Some(Halt::Rejected { status: 409 }));
    assert_eq!(engine.queue().len().unwrap(), 1);
    let route = &engine.routes().routes()[0];
    let entity = &engine.snapshot().select(route, Some(local.as_str())).unwrap()[0];
    assert_eq!(entity[OFFLINE_CONFLICT_FIELD], true);
    assert!(notifier
      .events()
      .contains(&ClientEvent::ReplayRejected { url: todos(), status: 409 }));
  }

  #[tokio::test]
  async fn test_rejected_create_blocks_dependent_update() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, _) = engine(network.clone());
    let local = create(&engine, "").await;
    let update = Request::new(Method::Patch, api_url(&format!("/rest/v1/todos?id=eq.{}", local)))
      .with_json(&json!({ "done": true }));
    engine.handle(update).await.unwrap();

    network.set_online(true);
    network.clear_log();
    network.respond(Method::Post, &todos(), Response::new(422, "title must not be empty"));
    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report.halted, Some(Halt::Rejected { status: 422 }));
    assert_eq!(network.requests(), vec![format!("POST {}", todos())]);
    assert_eq!(engine.queue().len().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_server_ids_replace_local_ids() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, _) = engine(network.clone());
    let local = create(&engine, "Buy milk").await;
    let update = Request::new(Method::Patch, api_url(&format!("/rest/v1/todos?id=eq.{}", local)))
      .with_json(&json!({ "done": true }));
    engine.handle(update).await.unwrap();

    network.set_online(true);
    network.clear_log();
    network.respond(
      Method::Post,
      &todos(),
      Response::json(201, &json!([{ "id": 99, "title": "Buy milk" }])),
    );
    let remote_update = api_url("/rest/v1/todos?id=eq.99").to_string();
    network.respond(Method::Patch, &remote_update, Response::new(204, ""));

    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report, ReplayReport { synced: 2, remaining: 0, halted: None });
    assert_eq!(network.requests()[1], format!("PATCH {}", remote_update));
    let route = &engine.routes().routes()[0];
    let items = engine.snapshot().load(route).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], 99);
    assert_eq!(items[0]["done"], true);
    assert!(items[0].get(OFFLINE_CREATED_FIELD).is_none());
  }

  #[tokio::test]
  async fn test_batch_ids_reconcile_without_clobbering_each_other() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, _) = engine(network.clone());
    let batch: Vec<_> = (0..12).map(|i| json!({ "title": format!("item {}", i) })).collect();
    let ack = engine
      .handle(Request::new(Method::Post, api_url("/rest/v1/todos")).with_json(&json!(batch)))
      .await
      .unwrap();
    let locals: Vec<String> = ack.data.body_json().unwrap()["ids"]
      .as_array()
      .unwrap()
      .iter()
      .map(|id| id.as_str().unwrap().to_string())
      .collect();
    assert_eq!(locals.len(), 12);

    let update = Request::new(Method::Patch, api_url(&format!("/rest/v1/todos?id=eq.{}", locals[10])))
      .with_json(&json!({ "done": true }));
    engine.handle(update).await.unwrap();

    network.set_online(true);
    network.clear_log();
    let created: Vec<_> = (0..12).map(|i| json!({ "id": 1000 + i })).collect();
    network.respond(Method::Post, &todos(), Response::json(201, &json!(created)));
    let remote_update = api_url("/rest/v1/todos?id=eq.1010").to_string();
    network.respond(Method::Patch, &remote_update, Response::new(204, ""));

    let report = finished(engine.replay().await.unwrap());

    assert_eq!(report, ReplayReport { synced: 2, remaining: 0, halted: None });
    assert_eq!(network.requests()[1], format!("PATCH {}", remote_update));
    let route = &engine.routes().routes()[0];
    let items = engine.snapshot().load(route).unwrap();
    let ids: Vec<_> = items.iter().map(|item| item["id"].clone()).collect();
    assert_eq!(ids, (1000..1012).map(|id| json!(id)).collect::<Vec<_>>());
    assert_eq!(items[10]["done"], true);
  }

  /// Storage whose writes to one named record fail once armed.
  #[derive(Default)]
  struct FlakyStorage {
    inner: MemoryStorage,
    failing: Mutex<Option<String>>,
  }

  impl FlakyStorage {
    fn fail_record(&self, name: &str) {
      *self.failing.lock().unwrap() = Some(name.to_string());
    }
  }

  impl CacheStorage for FlakyStorage {
    fn open_namespace(&self, namespace: &str) -> Result<()> {
      self.inner.open_namespace(namespace)
    }

    fn namespaces(&self) -> Result<Vec<String>> {
      self.inner.namespaces()
    }

    fn delete_namespace(&self, namespace: &str) -> Result<bool> {
      self.inner.delete_namespace(namespace)
    }

    fn put(&self, namespace: &str, key: &RequestKey, url: &str, response: &Response) -> Result<()> {
      self.inner.put(namespace, key, url, response)
    }

    fn put_all(&self, namespace: &str, entries: &[(RequestKey, String, Response)]) -> Result<()> {
      self.inner.put_all(namespace, entries)
    }

    fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
      self.inner.lookup(namespace, key)
    }

    fn entry_count(&self, namespace: &str) -> Result<usize> {
      self.inner.entry_count(namespace)
    }

    fn read_record(&self, namespace: &str, name: &str) -> Result<Option<String>> {
      self.inner.read_record(namespace, name)
    }

    fn update_record<T, F>(&self, namespace: &str, name: &str, f: F) -> Result<T>
    where
      F: FnOnce(Option<String>) -> Result<(String, T)>,
    {
      if self.failing.lock().unwrap().as_deref() == Some(name) {
        return Err(color_eyre::eyre::eyre!("disk full"));
      }
      self.inner.update_record(namespace, name, f)
    }
  }

  #[tokio::test]
  async fn test_storage_error_still_removes_accepted_writes() {
    let network = Arc::new(MockNetwork::offline());
    let storage = Arc::new(FlakyStorage::default());
    let notifier = Arc::new(crate::testing::RecordingNotifier::default());
    let engine = Interceptor::new(network.clone(), storage.clone(), settings("v1"), notifier.clone());
    engine.claim();
    let request = Request::new(Method::Post, api_url("/rest/v1/todos")).with_json(&json!({ "title": "a" }));
    engine.handle(request).await.unwrap();

    network.set_online(true);
    network.clear_log();
    network.respond(Method::Post, &todos(), Response::json(201, &json!([{ "id": 7 }])));
    storage.fail_record(&engine.routes().routes()[0].snapshot_record());

    assert!(engine.replay().await.is_err());
    assert!(engine.queue().is_empty().unwrap());
    assert_eq!(
      notifier.events().last(),
      Some(&ClientEvent::SyncCompleted { synced_count: 1, remaining_count: 0 })
    );

    // Nothing is submitted twice
    assert_eq!(engine.replay().await.unwrap(), ReplayOutcome::Empty);
    assert_eq!(network.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_attempt_cap_moves_entry_to_dead_letters() {
    let network = Arc::new(MockNetwork::offline());
    let mut settings = settings("v1");
    settings.max_replay_attempts = Some(2);
    let (engine, notifier) = engine_with(network, Arc::new(MemoryStorage::new()), settings);
    create(&engine, "a").await;

    let report = finished(engine.replay().await.unwrap());
    assert_eq!(report.remaining, 1);
    let report = finished(engine.replay().await.unwrap());
    assert_eq!(report.remaining, 0);

    assert_eq!(engine.queue().dead_letters().unwrap().len(), 1);
    assert!(notifier
      .events()
      .contains(&ClientEvent::DeadLettered { url: todos(), attempts: 2 }));
    assert_eq!(engine.replay().await.unwrap(), ReplayOutcome::Empty);
  }

  #[test]
  fn test_pass_guard_is_exclusive_until_dropped() {
    let flag = AtomicBool::new(false);
    let guard = PassGuard::acquire(&flag).unwrap();
    assert!(PassGuard::acquire(&flag).is_none());
    drop(guard);
    assert!(PassGuard::acquire(&flag).is_some());
  }

  #[tokio::test]
  async fn test_overlapping_replay_reports_already_running() {
    let network = Arc::new(MockNetwork::offline());
    let (engine, _) = engine(network.clone());
    create(&engine, "a").await;
    network.clear_log();

    let replayer = Replayer::new(
      network.clone(),
      MutationQueue::new(Arc::clone(engine.storage()), engine.namespaces().api.clone()),
      SnapshotStore::new(Arc::clone(engine.storage()), engine.namespaces().api.clone()),
      Arc::new(engine.routes().clone()),
      Arc::new(crate::testing::RecordingNotifier::default()),
      None,
    );
    let _held = PassGuard::acquire(&replayer.running).unwrap();

    assert_eq!(replayer.replay().await.unwrap(), ReplayOutcome::AlreadyRunning);
    assert!(network.requests().is_empty());
  }
}
