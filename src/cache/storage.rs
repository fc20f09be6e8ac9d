//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::key::RequestKey;
use crate::http::{Headers, Response};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  /// The URL the response was fetched from
  pub url: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Writing to a namespace that does not exist yet creates it. Every method is
/// atomic on its own; `update_record` is an atomic read-modify-write.
pub trait CacheStorage: Send + Sync {
  /// Create a namespace if it does not exist.
  fn open_namespace(&self, namespace: &str) -> Result<()>;

  /// Names of all existing namespaces, sorted.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace with all its entries and records.
  /// Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Store a response, replacing any entry with the same key.
  fn put(&self, namespace: &str, key: &RequestKey, url: &str, response: &Response) -> Result<()>;

  /// Store several responses in one transaction.
  fn put_all(&self, namespace: &str, entries: &[(RequestKey, String, Response)]) -> Result<()>;

  /// Exact-match lookup.
  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Number of response entries in a namespace.
  fn entry_count(&self, namespace: &str) -> Result<usize>;

  /// Read a named record.
  fn read_record(&self, namespace: &str, name: &str) -> Result<Option<String>>;

  /// Replace a named record with the value computed from its current value.
  /// Nothing is written if `f` fails.
  fn update_record<T, F>(&self, namespace: &str, name: &str, f: F) -> Result<T>
  where
    F: FnOnce(Option<String>) -> Result<(String, T)>;
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Debug, Default)]
struct MemoryNamespace {
  entries: HashMap<String, CachedEntry>,
  records: HashMap<String, String>,
}

/// Storage that keeps everything in process memory.
/// Used for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  namespaces: Mutex<BTreeMap<String, MemoryNamespace>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemoryNamespace>>> {
    self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    self.lock()?.entry(namespace.to_string()).or_default();
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    Ok(self.lock()?.remove(namespace).is_some())
  }

  fn put(&self, namespace: &str, key: &RequestKey, url: &str, response: &Response) -> Result<()> {
    let mut namespaces = self.lock()?;
    namespaces.entry(namespace.to_string()).or_default().entries.insert(
      key.as_str().to_string(),
      CachedEntry {
        url: url.to_string(),
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, namespace: &str, entries: &[(RequestKey, String, Response)]) -> Result<()> {
    let mut namespaces = self.lock()?;
    let ns = namespaces.entry(namespace.to_string()).or_default();
    let now = Utc::now();
    for (key, url, response) in entries {
      ns.entries.insert(
        key.as_str().to_string(),
        CachedEntry {
          url: url.clone(),
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|ns| ns.entries.get(key.as_str()))
        .cloned(),
    )
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    Ok(self.lock()?.get(namespace).map_or(0, |ns| ns.entries.len()))
  }

  fn read_record(&self, namespace: &str, name: &str) -> Result<Option<String>> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|ns| ns.records.get(name))
        .cloned(),
    )
  }

  fn update_record<T, F>(&self, namespace: &str, name: &str, f: F) -> Result<T>
  where
    F: FnOnce(Option<String>) -> Result<(String, T)>,
  {
    let mut namespaces = self.lock()?;
    let current = namespaces
      .get(namespace)
      .and_then(|ns| ns.records.get(name))
      .cloned();
    let (value, out) = f(current)?;
    namespaces
      .entry(namespace.to_string())
      .or_default()
      .records
      .insert(name.to_string(), value);
    Ok(out)
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-relay").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, one per request key per namespace
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, request_key)
);

-- Named JSON records (offline queue, entity snapshots)
CREATE TABLE IF NOT EXISTS cache_records (
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, name)
);
"#;

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  namespace: &str,
  key: &RequestKey,
  url: &str,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, request_key, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![namespace, key.as_str(), url, response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_namespace(&conn, namespace)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete cache entries: {}", e))?;
    tx.execute(
      "DELETE FROM cache_records WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete cache records: {}", e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete namespace: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, namespace: &str, key: &RequestKey, url: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    ensure_namespace(&conn, namespace)?;
    insert_entry(&conn, namespace, key, url, response)
  }

  fn put_all(&self, namespace: &str, entries: &[(RequestKey, String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace)?;
    for (key, url, response) in entries {
      insert_entry(&tx, namespace, key, url, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = stmt
      .query_row(params![namespace, key.as_str()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache entry: {}", e))?;

    match row {
      Some((url, status, headers, body, cached_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedEntry {
          url,
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count as usize)
  }

  fn read_record(&self, namespace: &str, name: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM cache_records WHERE namespace = ? AND name = ?",
        params![namespace, name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read record {}: {}", name, e))
  }

  fn update_record<T, F>(&self, namespace: &str, name: &str, f: F) -> Result<T>
  where
    F: FnOnce(Option<String>) -> Result<(String, T)>,
  {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current: Option<String> = tx
      .query_row(
        "SELECT value FROM cache_records WHERE namespace = ? AND name = ?",
        params![namespace, name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read record {}: {}", name, e))?;

    // Dropping the transaction on error rolls it back
    let (value, out) = f(current)?;

    ensure_namespace(&tx, namespace)?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_records (namespace, name, value, updated_at)
       VALUES (?, ?, ?, datetime('now'))",
      params![namespace, name, value],
    )
    .map_err(|e| eyre!("Failed to write record {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(out)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
