//! Offline-capable caching relay for a TODO web app.
//!
//! Requests are intercepted by [`engine::Interceptor`], which serves static
//! assets cache-first, API reads from the network with cache and snapshot
//! fallbacks, and queues API writes made while offline. Queued writes are
//! replayed in order by [`replay::Replayer`] when connectivity returns.

pub mod cache;
pub mod config;
pub mod engine;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod notify;
pub mod queue;
pub mod replay;
pub mod routes;
pub mod server;
pub mod snapshot;

#[cfg(test)]
mod testing;
