//! Fetch coordination with a two-tier cache.
//!
//! The central type is the [`FetchCoordinator`](coordinator::FetchCoordinator). It fetches opaque
//! byte payloads through a [`Transport`](transport::Transport), deduplicates concurrent requests
//! for the same [`CacheKey`](caching::CacheKey), serves results from an in-memory and a
//! file-system cache, and retries transient failures with exponential backoff.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod inflight;
pub mod retry;
pub mod transport;
pub mod utils;

pub use caching::{CacheContents, CacheEntry, CacheError, CacheKey};
pub use coordinator::{FetchCoordinator, FetchHandle, FetchOptions};
pub use inflight::CancelHandle;
pub use transport::{FetchRequest, HttpTransport, Response, Transport, TransportError};
