//! Optimistic entity snapshots.
//!
//! Each configured collection keeps a JSON array mirroring every write applied
//! so far, confirmed or not. It is the source of truth for offline reads.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::CacheStorage;
use crate::http::{Method, Request};
use crate::routes::{CollectionRoute, RouteMatch};

/// Marks entities created while offline.
pub const OFFLINE_CREATED_FIELD: &str = "offline_created";
/// Marks entities whose replayed write was rejected by the server.
pub const OFFLINE_CONFLICT_FIELD: &str = "offline_conflict";

static LOCAL_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Synthesize an identifier for an entity created offline.
///
/// The sequence is zero-padded so no id is a prefix of another.
pub fn next_local_id(prefix: &str) -> String {
  let seq = LOCAL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
  format!("{}{}_{:010}", prefix, Utc::now().timestamp_millis(), seq)
}

/// Entity identifier as a string, whether stored as a string or a number.
pub fn entity_id(entity: &Value, id_field: &str) -> Option<String> {
  match entity.get(id_field)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// A write whose body cannot be turned into a snapshot change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {method} body for collection {collection}: {reason}")]
pub struct MalformedBody {
  pub method: Method,
  pub collection: String,
  pub reason: String,
}

/// The effect of one write on a collection snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
  /// New entities, already carrying their ids
  Insert(Vec<Value>),
  /// Shallow merge of fields into one entity
  Merge { id: String, patch: Map<String, Value> },
  Remove { id: String },
  /// The write targets no single entity (e.g. a filtered bulk update)
  Untracked,
}

impl Change {
  /// Derive the change a write request makes to the matched collection.
  pub fn from_request(request: &Request, matched: &RouteMatch<'_>) -> Result<Self, MalformedBody> {
    let route = matched.route;
    let malformed = |reason: String| MalformedBody {
      method: request.method,
      collection: route.name.clone(),
      reason,
    };

    match request.method {
      Method::Post => {
        let body: Value = serde_json::from_slice(&request.body).map_err(|e| malformed(e.to_string()))?;
        let objects = match body {
          Value::Object(obj) => vec![obj],
          Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
              Value::Object(obj) => Ok(obj),
              _ => Err(malformed("array items must be objects".to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?,
          _ => return Err(malformed("expected an object or an array of objects".to_string())),
        };

        let created_at = Utc::now().to_rfc3339();
        let entities = objects
          .into_iter()
          .map(|mut obj| {
            let has_id = obj.get(&route.id_field).is_some_and(|v| !v.is_null());
            if !has_id {
              obj.insert(
                route.id_field.clone(),
                Value::String(next_local_id(&route.local_id_prefix)),
              );
            }
            obj
              .entry("created_at")
              .or_insert_with(|| Value::String(created_at.clone()));
            obj.insert(OFFLINE_CREATED_FIELD.to_string(), Value::Bool(true));
            Value::Object(obj)
          })
          .collect();

        Ok(Self::Insert(entities))
      }
      Method::Put | Method::Patch => {
        let body: Value = serde_json::from_slice(&request.body).map_err(|e| malformed(e.to_string()))?;
        let patch = match body {
          Value::Object(obj) => obj,
          _ => return Err(malformed("expected an object".to_string())),
        };
        match &matched.target_id {
          Some(id) => Ok(Self::Merge {
            id: id.clone(),
            patch,
          }),
          None => Ok(Self::Untracked),
        }
      }
      Method::Delete => match &matched.target_id {
        Some(id) => Ok(Self::Remove { id: id.clone() }),
        None => Ok(Self::Untracked),
      },
      _ => Ok(Self::Untracked),
    }
  }

  /// Ids of inserted entities, in body order.
  pub fn inserted_ids(&self, id_field: &str) -> Vec<String> {
    match self {
      Self::Insert(entities) => entities
        .iter()
        .filter_map(|e| entity_id(e, id_field))
        .collect(),
      _ => Vec::new(),
    }
  }

  /// Ids of entities this change touches.
  pub fn touched_ids(&self, id_field: &str) -> Vec<String> {
    match self {
      Self::Insert(_) => self.inserted_ids(id_field),
      Self::Merge { id, .. } | Self::Remove { id } => vec![id.clone()],
      Self::Untracked => Vec::new(),
    }
  }

  /// Apply this change to a collection.
  pub fn apply_to(&self, items: &mut Vec<Value>, id_field: &str) {
    match self {
      Self::Insert(entities) => items.extend(entities.iter().cloned()),
      Self::Merge { id, patch } => {
        let target = items
          .iter_mut()
          .find(|item| entity_id(item, id_field).as_deref() == Some(id.as_str()));
        if let Some(Value::Object(existing)) = target {
          for (key, value) in patch {
            existing.insert(key.clone(), value.clone());
          }
        }
      }
      Self::Remove { id } => {
        items.retain(|item| entity_id(item, id_field).as_deref() != Some(id.as_str()));
      }
      Self::Untracked => {}
    }
  }
}

/// Persisted snapshots, one record per collection in the API namespace.
pub struct SnapshotStore<S: CacheStorage> {
  storage: Arc<S>,
  namespace: String,
}

impl<S: CacheStorage> SnapshotStore<S> {
  pub fn new(storage: Arc<S>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
    }
  }

  /// Current snapshot; empty if none was ever written.
  pub fn load(&self, route: &CollectionRoute) -> Result<Vec<Value>> {
    match self
      .storage
      .read_record(&self.namespace, &route.snapshot_record())?
    {
      Some(raw) => parse_items(&raw),
      None => Ok(Vec::new()),
    }
  }

  /// Entities matching `target_id`, or the whole collection.
  pub fn select(&self, route: &CollectionRoute, target_id: Option<&str>) -> Result<Vec<Value>> {
    let items = self.load(route)?;
    Ok(match target_id {
      Some(id) => items
        .into_iter()
        .filter(|item| entity_id(item, &route.id_field).as_deref() == Some(id))
        .collect(),
      None => items,
    })
  }

  /// Replace the snapshot wholesale, e.g. after a successful collection read.
  pub fn replace(&self, route: &CollectionRoute, items: Vec<Value>) -> Result<()> {
    self.modify(route, |current| *current = items)
  }

  pub fn apply(&self, route: &CollectionRoute, change: &Change) -> Result<()> {
    self.modify(route, |items| change.apply_to(items, &route.id_field))
  }

  /// Swap local ids for server-assigned ones, keeping the server's JSON type.
  pub fn remap_ids(&self, route: &CollectionRoute, pairs: &[(String, Value)]) -> Result<()> {
    self.modify(route, |items| {
      for item in items.iter_mut() {
        let Some(current) = entity_id(item, &route.id_field) else {
          continue;
        };
        let Some((_, remote)) = pairs.iter().find(|(local, _)| *local == current) else {
          continue;
        };
        if let Value::Object(obj) = item {
          obj.insert(route.id_field.clone(), remote.clone());
          obj.remove(OFFLINE_CREATED_FIELD);
        }
      }
    })
  }

  /// Flag entities as conflicted. Returns how many were found.
  pub fn flag_conflict(&self, route: &CollectionRoute, ids: &[String]) -> Result<usize> {
    self.modify(route, |items| {
      let mut flagged = 0;
      for item in items.iter_mut() {
        let matches = entity_id(item, &route.id_field).is_some_and(|id| ids.contains(&id));
        if let (true, Value::Object(obj)) = (matches, item) {
          obj.insert(OFFLINE_CONFLICT_FIELD.to_string(), Value::Bool(true));
          flagged += 1;
        }
      }
      flagged
    })
  }

  fn modify<T>(&self, route: &CollectionRoute, f: impl FnOnce(&mut Vec<Value>) -> T) -> Result<T> {
    self
      .storage
      .update_record(&self.namespace, &route.snapshot_record(), |current| {
        let mut items = match current {
          Some(raw) => parse_items(&raw)?,
          None => Vec::new(),
        };
        let out = f(&mut items);
        let raw = serde_json::to_string(&items)
          .map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
        Ok((raw, out))
      })
  }
}

fn parse_items(raw: &str) -> Result<Vec<Value>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Failed to parse snapshot: {}", e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::routes::RouteTable;
  use serde_json::json;
  use url::Url;

  fn table() -> RouteTable {
    RouteTable::new(vec![CollectionRoute::new("todos", "/rest/v1/todos")])
  }

  fn write(method: Method, path: &str, body: &str) -> Request {
    let url = Url::parse("https://x.supabase.co").unwrap().join(path).unwrap();
    Request::new(method, url).with_body(body)
  }

  fn change_for(request: &Request) -> Result<Change, MalformedBody> {
    let table = table();
    let matched = table.match_url(&request.url).unwrap();
    Change::from_request(request, &matched)
  }

  #[test]
  fn test_insert_synthesizes_id_and_marks_offline() {
    let change = change_for(&write(Method::Post, "/rest/v1/todos", r#"{"title":"Buy milk"}"#)).unwrap();
    let ids = change.inserted_ids("id");
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("offline_"));

    let Change::Insert(entities) = &change else {
      panic!("expected insert, got {:?}", change);
    };
    assert_eq!(entities[0]["title"], "Buy milk");
    assert_eq!(entities[0][OFFLINE_CREATED_FIELD], true);
    assert!(entities[0]["created_at"].is_string());
  }

  #[test]
  fn test_insert_keeps_supplied_id() {
    let change = change_for(&write(Method::Post, "/rest/v1/todos", r#"[{"id":7},{"id":"x"}]"#)).unwrap();
    assert_eq!(change.inserted_ids("id"), vec!["7", "x"]);
  }

  #[test]
  fn test_local_ids_are_unique_and_prefix_free() {
    let ids: Vec<String> = (0..12).map(|_| next_local_id("offline_")).collect();
    for (i, a) in ids.iter().enumerate() {
      for b in &ids[i + 1..] {
        assert!(!a.starts_with(b.as_str()) && !b.starts_with(a.as_str()), "{} / {}", a, b);
      }
    }
  }

  #[test]
  fn test_malformed_bodies_are_rejected() {
    assert!(change_for(&write(Method::Post, "/rest/v1/todos", "not json")).is_err());
    assert!(change_for(&write(Method::Post, "/rest/v1/todos", "[1,2]")).is_err());
    assert!(change_for(&write(Method::Patch, "/rest/v1/todos/1", "\"x\"")).is_err());
    // DELETE bodies are ignored
    assert!(change_for(&write(Method::Delete, "/rest/v1/todos/1", "junk")).is_ok());
  }

  #[test]
  fn test_merge_and_remove_apply_by_id() {
    let mut items = vec![json!({"id": 1, "title": "a", "done": false}), json!({"id": "2", "title": "b"})];

    change_for(&write(Method::Patch, "/rest/v1/todos?id=eq.1", r#"{"done":true}"#))
      .unwrap()
      .apply_to(&mut items, "id");
    change_for(&write(Method::Delete, "/rest/v1/todos/2", ""))
      .unwrap()
      .apply_to(&mut items, "id");

    assert_eq!(items, vec![json!({"id": 1, "title": "a", "done": true})]);
  }

  #[test]
  fn test_update_without_target_is_untracked() {
    let change = change_for(&write(Method::Put, "/rest/v1/todos", r#"{"done":true}"#)).unwrap();
    assert_eq!(change, Change::Untracked);
  }

  #[test]
  fn test_store_remap_and_conflict() {
    let storage = Arc::new(MemoryStorage::new());
    let store = SnapshotStore::new(storage, "todo-api-v1");
    let route = CollectionRoute::new("todos", "/rest/v1/todos");

    assert!(store.load(&route).unwrap().is_empty());
    store
      .apply(&route, &Change::Insert(vec![json!({"id": "offline_1", "offline_created": true})]))
      .unwrap();
    store
      .remap_ids(&route, &[("offline_1".to_string(), json!(42))])
      .unwrap();
    assert_eq!(store.load(&route).unwrap(), vec![json!({"id": 42})]);

    assert_eq!(store.flag_conflict(&route, &["42".to_string()]).unwrap(), 1);
    assert_eq!(store.select(&route, Some("42")).unwrap()[0][OFFLINE_CONFLICT_FIELD], true);
    assert!(store.select(&route, Some("43")).unwrap().is_empty());
  }
}
