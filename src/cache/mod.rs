//! Versioned response caching and durable key-value records.
//!
//! This module provides the storage primitives the engine is built on:
//! - Response entries keyed by request identity, grouped into named namespaces
//! - Bulk deletion of a whole namespace (used for version migration)
//! - Small JSON records per namespace (the offline queue and entity snapshots)
//! - A `CacheLayer` that applies cache-first / network-first policies

mod key;
mod layer;
mod namespace;
mod storage;
mod traits;

pub use key::RequestKey;
pub use layer::CacheLayer;
pub use namespace::Namespaces;
pub use storage::{CacheStorage, CachedEntry, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
