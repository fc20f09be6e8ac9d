//! Test doubles and fixtures shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::cache::{MemoryStorage, Namespaces};
use crate::engine::{EngineSettings, Interceptor};
use crate::http::{Method, Request, Response};
use crate::network::{FetchError, Network};
use crate::notify::{ClientEvent, Notifier};
use crate::routes::{CollectionRoute, RouteTable};

type Outcome = Result<Response, FetchError>;

/// Network that answers from a script and records every request it sees.
///
/// While offline every fetch fails with `Unreachable`. Online, a queued
/// one-shot outcome for the request is used first, then the standing
/// response, then a 404.
pub struct MockNetwork {
  online: AtomicBool,
  standing: Mutex<HashMap<String, Response>>,
  scripted: Mutex<HashMap<String, VecDeque<Outcome>>>,
  log: Mutex<Vec<String>>,
}

fn key(method: Method, url: &str) -> String {
  format!("{} {}", method, url)
}

impl MockNetwork {
  pub fn online() -> Self {
    Self {
      online: AtomicBool::new(true),
      standing: Mutex::new(HashMap::new()),
      scripted: Mutex::new(HashMap::new()),
      log: Mutex::new(Vec::new()),
    }
  }

  pub fn offline() -> Self {
    let network = Self::online();
    network.set_online(false);
    network
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Answer every matching request with `response`.
  pub fn respond(&self, method: Method, url: &str, response: Response) {
    self.standing.lock().unwrap().insert(key(method, url), response);
  }

  /// Answer the next matching request with `outcome`.
  pub fn respond_once(&self, method: Method, url: &str, outcome: Outcome) {
    self
      .scripted
      .lock()
      .unwrap()
      .entry(key(method, url))
      .or_default()
      .push_back(outcome);
  }

  /// Every request seen so far, as `METHOD url`.
  pub fn requests(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  pub fn clear_log(&self) {
    self.log.lock().unwrap().clear();
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let k = key(request.method, request.url.as_str());
    self.log.lock().unwrap().push(k.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable("offline".to_string()));
    }

    if let Some(outcome) = self.scripted.lock().unwrap().get_mut(&k).and_then(VecDeque::pop_front) {
      return outcome;
    }

    Ok(
      self
        .standing
        .lock()
        .unwrap()
        .get(&k)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}

/// Notifier that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
  events: Mutex<Vec<ClientEvent>>,
}

impl RecordingNotifier {
  pub fn events(&self) -> Vec<ClientEvent> {
    self.events.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, event: ClientEvent) {
    self.events.lock().unwrap().push(event);
  }
}

pub const APP: &str = "https://app.test";
pub const API: &str = "https://demo.supabase.co";

pub fn app_url(path: &str) -> Url {
  Url::parse(APP).unwrap().join(path).unwrap()
}

pub fn api_url(path: &str) -> Url {
  Url::parse(API).unwrap().join(path).unwrap()
}

pub fn settings(version: &str) -> EngineSettings {
  EngineSettings {
    namespaces: Namespaces::for_version("todo-app", "todo-api", version),
    routes: RouteTable::new(vec![CollectionRoute::new("todos", "/rest/v1/todos")]),
    api_hosts: vec!["supabase.co".to_string()],
    offline_shell: Some(app_url("/index.html")),
    max_replay_attempts: None,
  }
}

pub type TestEngine = Interceptor<MockNetwork, MemoryStorage>;

/// A claimed engine over fresh in-memory storage.
pub fn engine(network: Arc<MockNetwork>) -> (TestEngine, Arc<RecordingNotifier>) {
  engine_with(network, Arc::new(MemoryStorage::new()), settings("v1"))
}

pub fn engine_with(
  network: Arc<MockNetwork>,
  storage: Arc<MemoryStorage>,
  settings: EngineSettings,
) -> (TestEngine, Arc<RecordingNotifier>) {
  let notifier = Arc::new(RecordingNotifier::default());
  let engine = Interceptor::new(network, storage, settings, notifier.clone());
  engine.claim();
  (engine, notifier)
}

/// A shared engine that nothing has claimed yet, as the lifecycle sees it.
pub fn unclaimed(
  network: Arc<MockNetwork>,
  storage: Arc<MemoryStorage>,
  version: &str,
) -> (Arc<TestEngine>, Arc<RecordingNotifier>) {
  let notifier = Arc::new(RecordingNotifier::default());
  let engine = Interceptor::new(network, storage, settings(version), notifier.clone());
  (Arc::new(engine), notifier)
}
