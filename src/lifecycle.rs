//! Install/activate lifecycle and replay triggers.

use color_eyre::Report;
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::engine::Interceptor;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::queue::{read_list, QueuedMutation, DEAD_LETTER_RECORD, QUEUE_RECORD};
use crate::replay::ReplayOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Parsed,
  Installing,
  /// Waiting to activate
  Installed,
  Activating,
  Active,
  /// A failed install
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
  #[error("install failed for {url}: {reason}")]
  InstallFailed { url: String, reason: String },
  #[error("cannot {action} while {from}")]
  InvalidTransition {
    from: LifecycleState,
    action: &'static str,
  },
  #[error("storage error: {0}")]
  Storage(Report),
}

impl From<Report> for LifecycleError {
  fn from(report: Report) -> Self {
    Self::Storage(report)
  }
}

/// Drives one deployed version from install to active.
pub struct Lifecycle<N: Network, S: CacheStorage> {
  engine: Arc<Interceptor<N, S>>,
  version: String,
  manifest: Vec<Url>,
  state: Mutex<LifecycleState>,
}

impl<N: Network, S: CacheStorage> Lifecycle<N, S> {
  pub fn new(engine: Arc<Interceptor<N, S>>, version: impl Into<String>, manifest: Vec<Url>) -> Self {
    Self {
      engine,
      version: version.into(),
      manifest,
      state: Mutex::new(LifecycleState::Parsed),
    }
  }

  pub fn engine(&self) -> &Arc<Interceptor<N, S>> {
    &self.engine
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> LifecycleState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_state(&self, next: LifecycleState) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    debug!(from = %*state, to = %next, "Lifecycle transition");
    *state = next;
  }

  /// Move to `next` if the current state is one of `allowed`.
  /// Returns the state left behind.
  fn transition(
    &self,
    allowed: &[LifecycleState],
    next: LifecycleState,
    action: &'static str,
  ) -> Result<LifecycleState, LifecycleError> {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    if !allowed.contains(&*state) {
      return Err(LifecycleError::InvalidTransition { from: *state, action });
    }
    Ok(std::mem::replace(&mut *state, next))
  }

  /// Precache the manifest into this version's static namespace.
  ///
  /// All manifest URLs are fetched concurrently. Nothing is written unless
  /// every one of them succeeds. If this version was installed before (its
  /// static namespace is already stored), a failed precache keeps the stored
  /// copy and still counts as installed, so a restart while offline serves
  /// from it. Reinstalling an active version leaves it active.
  pub async fn install(&self) -> Result<(), LifecycleError> {
    let previous = self.transition(
      &[
        LifecycleState::Parsed,
        LifecycleState::Installed,
        LifecycleState::Active,
        LifecycleState::Redundant,
      ],
      LifecycleState::Installing,
      "install",
    )?;
    let done = match previous {
      LifecycleState::Active => LifecycleState::Active,
      _ => LifecycleState::Installed,
    };
    info!(version = %self.version, assets = self.manifest.len(), "Installing");

    match self.precache().await {
      Ok(()) => {
        self.set_state(done);
        info!(version = %self.version, "Installed");
        Ok(())
      }
      Err(e) if self.previously_installed() => {
        self.set_state(done);
        warn!(version = %self.version, "Precache failed, keeping stored assets: {}", e);
        Ok(())
      }
      Err(e) => {
        self.set_state(LifecycleState::Redundant);
        error!(version = %self.version, "Install failed: {}", e);
        Err(e)
      }
    }
  }

  fn previously_installed(&self) -> bool {
    let current = &self.engine.namespaces().static_assets;
    match self.engine.storage().namespaces() {
      Ok(names) => names.contains(current),
      Err(e) => {
        warn!("Failed to list cache namespaces: {}", e);
        false
      }
    }
  }

  async fn precache(&self) -> Result<(), LifecycleError> {
    let network = self.engine.network();
    let requests: Vec<Request> = self.manifest.iter().cloned().map(Request::get).collect();
    let responses = join_all(requests.iter().map(|request| network.fetch(request))).await;

    let mut entries: Vec<(RequestKey, String, Response)> = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      let url = request.url.to_string();
      let response = response.map_err(|e| LifecycleError::InstallFailed {
        url: url.clone(),
        reason: e.to_string(),
      })?;
      if !response.is_success() {
        return Err(LifecycleError::InstallFailed {
          url,
          reason: format!("status {}", response.status),
        });
      }
      entries.push((RequestKey::for_request(request), url, response));
    }

    let namespaces = self.engine.namespaces();
    let storage = self.engine.storage();
    storage.put_all(&namespaces.static_assets, &entries)?;
    storage.open_namespace(&namespaces.static_assets)?;
    storage.open_namespace(&namespaces.api)?;
    Ok(())
  }

  /// Retire older versions, claim the engine and run a replay pass.
  pub async fn activate(&self) -> Result<ReplayOutcome, LifecycleError> {
    self.transition(&[LifecycleState::Installed], LifecycleState::Activating, "activate")?;
    info!(version = %self.version, "Activating");

    if let Err(e) = self.migrate() {
      self.set_state(LifecycleState::Installed);
      return Err(e.into());
    }

    self.engine.claim();
    self.set_state(LifecycleState::Active);
    info!(version = %self.version, "Active");

    Ok(self.engine.replay().await?)
  }

  /// Carry offline state out of superseded API namespaces, then delete every
  /// namespace that is not current.
  fn migrate(&self) -> color_eyre::Result<()> {
    let namespaces = self.engine.namespaces();
    let storage = self.engine.storage();
    let stale: Vec<String> = storage
      .namespaces()?
      .into_iter()
      .filter(|name| !namespaces.is_current(name))
      .collect();

    let mut queued: Vec<QueuedMutation> = Vec::new();
    let mut dead: Vec<QueuedMutation> = Vec::new();
    for name in stale.iter().filter(|name| namespaces.is_api_namespace(name)) {
      queued.extend(read_list(&**storage, name, QUEUE_RECORD)?);
      dead.extend(read_list(&**storage, name, DEAD_LETTER_RECORD)?);

      for route in self.engine.routes().routes() {
        let record = route.snapshot_record();
        if storage.read_record(&namespaces.api, &record)?.is_some() {
          continue;
        }
        if let Some(raw) = storage.read_record(name, &record)? {
          storage.update_record(&namespaces.api, &record, |_| Ok((raw, ())))?;
          debug!(from = %name, collection = %route.name, "Carried snapshot over");
        }
      }
    }

    if !queued.is_empty() {
      queued.sort_by_key(|m| m.timestamp);
      let carried = queued.len();
      let size = self.engine.queue().adopt(queued)?;
      info!(carried, queue_size = size, "Carried offline queue over");
    }
    if !dead.is_empty() {
      dead.sort_by_key(|m| m.timestamp);
      self.engine.queue().adopt_dead_letters(dead)?;
    }

    for name in &stale {
      if storage.delete_namespace(name)? {
        info!(namespace = %name, "Deleted old cache namespace");
      }
    }
    Ok(())
  }
}

/// Reasons to attempt a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  ConnectivityRestored,
  Periodic,
}

/// Sends replay triggers to the dispatcher started by [`spawn_triggers`].
#[derive(Debug, Clone)]
pub struct TriggerHandle {
  tx: mpsc::UnboundedSender<Trigger>,
}

impl TriggerHandle {
  pub fn connectivity_restored(&self) {
    self.send(Trigger::ConnectivityRestored);
  }

  pub fn periodic(&self) {
    self.send(Trigger::Periodic);
  }

  fn send(&self, trigger: Trigger) {
    if self.tx.send(trigger).is_err() {
      warn!(?trigger, "Trigger dispatcher has stopped");
    }
  }
}

/// Start the trigger dispatcher. Each trigger runs a replay pass in its own
/// task; with `interval` set, periodic triggers fire on a timer as well.
pub fn spawn_triggers<N, S>(
  engine: Arc<Interceptor<N, S>>,
  interval: Option<Duration>,
) -> (TriggerHandle, JoinHandle<()>)
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  let (tx, mut rx) = mpsc::unbounded_channel();

  let task = tokio::spawn(async move {
    let mut ticker = interval.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      ticker
    });

    loop {
      let trigger = match ticker.as_mut() {
        Some(ticker) => tokio::select! {
          trigger = rx.recv() => trigger,
          _ = ticker.tick() => Some(Trigger::Periodic),
        },
        None => rx.recv().await,
      };
      let Some(trigger) = trigger else {
        break;
      };

      debug!(?trigger, "Replay triggered");
      let engine = Arc::clone(&engine);
      tokio::spawn(async move {
        match engine.replay().await {
          Ok(outcome) => debug!(?trigger, ?outcome, "Triggered replay finished"),
          Err(e) => error!(?trigger, "Triggered replay failed: {}", e),
        }
      });
    }
  });

  (TriggerHandle { tx }, task)
}
