//! Core types describing where a response came from.

use chrono::{DateTime, Utc};

use crate::http::{Response, OFFLINE_SOURCE_HEADER};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cached entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Data built from the optimistic entity snapshot.
  pub fn from_snapshot(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Snapshot,
      cached_at: None,
    }
  }

  /// A write accepted locally but not yet confirmed by the server.
  pub fn offline_ack(data: T) -> Self {
    Self {
      data,
      source: CacheSource::OfflineAck,
      cached_at: None,
    }
  }

  /// A deterministic stand-in (offline shell, empty image).
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  pub fn is_live(&self) -> bool {
    self.source == CacheSource::Network
  }
}

impl CacheResult<Response> {
  /// Unwrap into a response, marking anything not served live.
  pub fn into_response(self) -> Response {
    match self.source.marker() {
      Some(marker) => self.data.with_header(OFFLINE_SOURCE_HEADER, marker),
      None => self.data,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Stored response from a cache namespace
  Cache,
  /// Synthesized from the optimistic entity snapshot
  Snapshot,
  /// Synthesized acknowledgment of a queued write
  OfflineAck,
  /// Offline shell document or empty image
  Fallback,
}

impl CacheSource {
  /// Value of the offline-origin header, `None` for live responses.
  pub fn marker(&self) -> Option<&'static str> {
    match self {
      Self::Network => None,
      Self::Cache => Some("cache"),
      Self::Snapshot => Some("snapshot"),
      Self::OfflineAck => Some("offline-ack"),
      Self::Fallback => Some("fallback"),
    }
  }
}
