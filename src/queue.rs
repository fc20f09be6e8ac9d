//! Persisted FIFO queue of writes that could not reach the network.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use crate::cache::CacheStorage;
use crate::http::{Headers, Method, Request};

/// Record holding the pending queue.
pub const QUEUE_RECORD: &str = "offline-queue";
/// Record holding entries that exhausted their replay attempts.
pub const DEAD_LETTER_RECORD: &str = "offline-dead-letter";

static MUTATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// One failed write attempt, captured so it can be resubmitted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
  /// Unique within the queue
  pub id: String,
  pub url: String,
  pub method: Method,
  pub headers: Headers,
  pub body: String,
  /// Submission time; ordering key only
  pub timestamp: DateTime<Utc>,
  /// Ids synthesized for entities this write inserted
  #[serde(default)]
  pub local_ids: Vec<String>,
  /// Failed replay attempts so far
  #[serde(default)]
  pub attempts: u32,
}

impl QueuedMutation {
  pub fn capture(request: &Request, local_ids: Vec<String>) -> Self {
    let timestamp = Utc::now();
    let seq = MUTATION_SEQ.fetch_add(1, Ordering::Relaxed);
    Self {
      id: format!("{}-{}", timestamp.timestamp_millis(), seq),
      url: request.url.to_string(),
      method: request.method,
      headers: request.headers.clone(),
      body: request.body_text(),
      timestamp,
      local_ids,
      attempts: 0,
    }
  }

  /// Rebuild the original request.
  pub fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL {}: {}", self.url, e))?;
    let mut request = Request::new(self.method, url).with_body(self.body.clone());
    request.headers = self.headers.clone();
    Ok(request)
  }

  /// Replace a local id with the server's id wherever it is a whole value:
  /// a URL path segment, an `eq.` filter value, or a JSON string in the body.
  ///
  /// `remote` keeps its JSON type in the body; the URL gets its text form.
  pub(crate) fn rewrite_id(&mut self, local: &str, remote: &Value) -> bool {
    let remote_text = match remote {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    };
    let url_changed = self.rewrite_url(local, &remote_text);
    let body_changed = self.rewrite_body(local, remote);
    url_changed || body_changed
  }

  fn rewrite_url(&mut self, local: &str, remote: &str) -> bool {
    let Ok(mut url) = Url::parse(&self.url) else {
      return false;
    };
    let mut changed = false;

    let segments: Vec<String> = url
      .path_segments()
      .map(|segments| segments.map(String::from).collect())
      .unwrap_or_default();
    if segments.iter().any(|segment| segment == local) {
      let rewritten = segments
        .iter()
        .map(|segment| if segment == local { remote } else { segment.as_str() });
      if let Ok(mut path) = url.path_segments_mut() {
        path.clear().extend(rewritten);
        changed = true;
      }
    }

    let filter = format!("eq.{}", local);
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.iter().any(|(_, value)| *value == filter) {
      let replacement = format!("eq.{}", remote);
      let rewritten: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(key, value)| {
          if value == filter {
            (key, replacement.clone())
          } else {
            (key, value)
          }
        })
        .collect();
      url.query_pairs_mut().clear().extend_pairs(rewritten);
      changed = true;
    }

    if changed {
      self.url = url.to_string();
    }
    changed
  }

  fn rewrite_body(&mut self, local: &str, remote: &Value) -> bool {
    let Ok(mut body) = serde_json::from_str::<Value>(&self.body) else {
      return false;
    };
    if !replace_value(&mut body, local, remote) {
      return false;
    }
    match serde_json::to_string(&body) {
      Ok(raw) => {
        self.body = raw;
        true
      }
      Err(_) => false,
    }
  }
}

/// Replace every string equal to `local`, at any depth.
fn replace_value(value: &mut Value, local: &str, remote: &Value) -> bool {
  if value.as_str() == Some(local) {
    *value = remote.clone();
    return true;
  }
  match value {
    Value::Array(items) => items
      .iter_mut()
      .fold(false, |changed, item| replace_value(item, local, remote) || changed),
    Value::Object(fields) => fields
      .values_mut()
      .fold(false, |changed, item| replace_value(item, local, remote) || changed),
    _ => false,
  }
}

/// The offline queue and its dead-letter list, stored as records in the API namespace.
pub struct MutationQueue<S: CacheStorage> {
  storage: Arc<S>,
  namespace: String,
}

impl<S: CacheStorage> MutationQueue<S> {
  pub fn new(storage: Arc<S>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
    }
  }

  /// All pending entries, oldest first.
  pub fn load(&self) -> Result<Vec<QueuedMutation>> {
    read_list(&*self.storage, &self.namespace, QUEUE_RECORD)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.load()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Append to the tail. Returns the new queue length.
  pub fn append(&self, mutation: QueuedMutation) -> Result<usize> {
    self.modify(QUEUE_RECORD, |queue| {
      queue.push(mutation);
      queue.len()
    })
  }

  /// Put older entries in front of the current ones, e.g. when carrying a
  /// queue over from a superseded namespace. Returns the new queue length.
  pub fn adopt(&self, older: Vec<QueuedMutation>) -> Result<usize> {
    self.prepend(QUEUE_RECORD, older)
  }

  /// Same as [`adopt`](Self::adopt), for the dead-letter list.
  pub fn adopt_dead_letters(&self, older: Vec<QueuedMutation>) -> Result<usize> {
    self.prepend(DEAD_LETTER_RECORD, older)
  }

  /// Remove entries by id in one update; everything else keeps its order.
  /// Returns the remaining length.
  pub fn remove(&self, ids: &[String]) -> Result<usize> {
    self.modify(QUEUE_RECORD, |queue| {
      queue.retain(|m| !ids.contains(&m.id));
      queue.len()
    })
  }

  /// Count a failed replay attempt. Returns the new attempt count.
  pub fn record_failure(&self, id: &str) -> Result<u32> {
    self.modify(QUEUE_RECORD, |queue| {
      match queue.iter_mut().find(|m| m.id == id) {
        Some(m) => {
          m.attempts += 1;
          m.attempts
        }
        None => 0,
      }
    })
  }

  /// Rewrite a local id in every pending entry. Returns how many changed.
  pub fn rewrite_local_id(&self, local: &str, remote: &Value) -> Result<usize> {
    self.modify(QUEUE_RECORD, |queue| {
      queue
        .iter_mut()
        .map(|m| m.rewrite_id(local, remote))
        .filter(|changed| *changed)
        .count()
    })
  }

  /// Move an entry to the dead-letter list. Returns the remaining queue length.
  pub fn dead_letter(&self, id: &str) -> Result<usize> {
    let mut moved = None;
    let remaining = self.modify(QUEUE_RECORD, |queue| {
      if let Some(pos) = queue.iter().position(|m| m.id == id) {
        moved = Some(queue.remove(pos));
      }
      queue.len()
    })?;

    if let Some(mutation) = moved {
      self.modify(DEAD_LETTER_RECORD, |dead| dead.push(mutation))?;
    }

    Ok(remaining)
  }

  pub fn dead_letters(&self) -> Result<Vec<QueuedMutation>> {
    read_list(&*self.storage, &self.namespace, DEAD_LETTER_RECORD)
  }

  /// Drop every pending entry. Returns how many were dropped.
  pub fn purge(&self) -> Result<usize> {
    self.modify(QUEUE_RECORD, |queue| std::mem::take(queue).len())
  }

  /// Drop every dead letter. Returns how many were dropped.
  pub fn purge_dead_letters(&self) -> Result<usize> {
    self.modify(DEAD_LETTER_RECORD, |dead| std::mem::take(dead).len())
  }

  fn prepend(&self, record: &str, older: Vec<QueuedMutation>) -> Result<usize> {
    self.modify(record, |list| {
      let newer = std::mem::take(list);
      list.extend(older.into_iter().filter(|m| !newer.iter().any(|n| n.id == m.id)));
      list.extend(newer);
      list.len()
    })
  }

  fn modify<T>(&self, record: &str, f: impl FnOnce(&mut Vec<QueuedMutation>) -> T) -> Result<T> {
    self
      .storage
      .update_record(&self.namespace, record, |current| {
        let mut list = match current {
          Some(raw) => parse_list(&raw)?,
          None => Vec::new(),
        };
        let out = f(&mut list);
        let raw = serde_json::to_string(&list)
          .map_err(|e| eyre!("Failed to serialize offline queue: {}", e))?;
        Ok((raw, out))
      })
  }
}

/// Read a queue-shaped record from any namespace.
pub fn read_list<S: CacheStorage>(
  storage: &S,
  namespace: &str,
  record: &str,
) -> Result<Vec<QueuedMutation>> {
  match storage.read_record(namespace, record)? {
    Some(raw) => parse_list(&raw),
    None => Ok(Vec::new()),
  }
}

fn parse_list(raw: &str) -> Result<Vec<QueuedMutation>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse offline queue: {}", e))
}
