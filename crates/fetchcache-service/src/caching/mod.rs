//! # Fetchcache caching infrastructure
//!
//! Fetched payloads are kept in two independent cache tiers. This module contains both tiers,
//! the [`CacheKey`] naming the entries in them, the central [`CacheError`] type, and the
//! maintenance of the file-system tier.
//!
//! ## Cache Layers
//!
//! - An in-memory layer ([`MemoryCache`]), bounded both by the number of entries and by their
//!   summed size.
//! - A file-system layer ([`BlobStore`]) that persists payloads, bounded by the total size of all
//!   files. It is only active when a `cache_dir` is configured.
//!
//! A fetch goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it joins a running fetch for the same key, if there is one.
//! - Otherwise it tries to load the entry from the file-system, and promotes it into memory.
//! - On miss, it finally fetches a fresh payload through the transport, which is stored in both
//!   layers before all waiting callers are notified.
//!
//! Failures are never cached.
//!
//! ### Expiration
//!
//! An entry is usable for `entry_lifetime` after it was fetched, in both layers. The file-system
//! layer keeps the time of the fetch as the `mtime` of the file. Expired entries are misses and
//! are removed when they are encountered, and by the periodic [cleanup](BlobStore::cleanup).
//!
//! ### Eviction
//!
//! The in-memory layer evicts according to the policy of [`moka`]. The file-system layer is shrunk
//! by the [`EvictionPolicy`] whenever it grows beyond its size limit: after removing expired files,
//! the oldest files are removed until the total size is at 80% of the limit.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.inflight.joined`: Accesses that joined an already running fetch.
//! - `caches.file.hit`: Accesses served by the file-system layer.
//! - `caches.computation`: Actual fetches through the transport.
//! - `caches.file.write`: The number of entries being written to disk.
//! - `caches.size.*`: Gauges and counters emitted by the cleanup.

mod cache_error;
mod cache_key;
mod cleanup;
mod entry;
mod fs;
mod memory;


pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::{CleanupStats, EvictionPlan, EvictionPolicy, cleanup};
pub use entry::CacheEntry;
pub use fs::{BlobStore, StorageError, StoredBlob};
pub use memory::MemoryCache;
