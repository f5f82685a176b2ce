//! The [`FetchCoordinator`], tying the cache tiers, request deduplication and retries together.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::caching::{
    BlobStore, CacheContents, CacheEntry, CacheError, CacheKey, CleanupStats, MemoryCache,
};
use crate::config::Config;
use crate::inflight::{CancelHandle, InFlightRegistry, PendingFetch, Waiter};
use crate::retry::RetryPolicy;
use crate::transport::{FetchRequest, Response, Transport, TransportError};
use crate::utils::futures::{CallOnDrop, m, measure};

/// Per-call options of [`FetchCoordinator::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Whether to read from and write to the caches, and join running fetches.
    ///
    /// Without caching, every call results in its own transport fetch. Defaults to `true`.
    pub use_cache: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

impl FetchOptions {
    /// Options that bypass both cache tiers.
    pub fn no_cache() -> Self {
        Self { use_cache: false }
    }
}

/// A snapshot of the state of a [`FetchCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// The (approximate) number of entries in the in-memory cache.
    pub memory_entries: u64,
    /// The (approximate) weight of the in-memory cache.
    pub memory_weight: u64,
    /// The estimated size of the file-system cache in bytes.
    pub estimated_disk_bytes: u64,
    /// The number of running, joinable fetches.
    pub inflight: usize,
}

/// The result of a [`FetchCoordinator::fetch`].
///
/// This is a future resolving to the payload or the error of the fetch. Dropping it before it
/// resolved retracts the interest of the caller, see [`CancelHandle`].
#[derive(Debug)]
pub struct FetchHandle {
    inner: FetchHandleInner,
}

#[derive(Debug)]
enum FetchHandleInner {
    Ready(Option<CacheContents>),
    Waiting(Waiter),
}

impl FetchHandle {
    fn ready(result: CacheContents) -> Self {
        Self {
            inner: FetchHandleInner::Ready(Some(result)),
        }
    }

    fn waiting(waiter: Waiter) -> Self {
        Self {
            inner: FetchHandleInner::Waiting(waiter),
        }
    }

    /// A handle that retracts the interest of this caller.
    ///
    /// This can be sent to other tasks, unlike the [`FetchHandle`] itself which is usually
    /// awaited.
    pub fn cancel_handle(&self) -> CancelHandle {
        match &self.inner {
            FetchHandleInner::Ready(_) => CancelHandle::noop(),
            FetchHandleInner::Waiting(waiter) => waiter.cancel_handle(),
        }
    }

    /// Retracts the interest of this caller, see [`CancelHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.cancel_handle().cancel()
    }
}

impl Future for FetchHandle {
    type Output = CacheContents;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            FetchHandleInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(CacheError::InternalError)))
            }
            FetchHandleInner::Waiting(waiter) => Pin::new(waiter).poll(cx),
        }
    }
}

/// Fetches payloads through a [`Transport`], backed by an in-memory and a file-system cache.
///
/// Concurrent fetches of the same [`CacheKey`] are deduplicated into a single transport fetch,
/// and transient failures are retried with exponential backoff. Failures are never cached.
///
/// The coordinator is cheap to clone, all clones share the same caches.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk)
            .field("inflight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

struct Inner {
    memory: MemoryCache,
    disk: Option<BlobStore>,
    inflight: InFlightRegistry,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    /// Bounds the number of concurrent transport attempts.
    fetch_permits: Semaphore,
    /// Timeout of a single transport attempt.
    timeout: Duration,
    runtime: Handle,
    maintenance_running: Arc<AtomicBool>,
    estimated_disk_size: Arc<AtomicU64>,
}

impl FetchCoordinator {
    /// Creates a coordinator that runs its fetches and maintenance on `runtime`.
    ///
    /// This clears leftover temporary files and starts a maintenance pass of the file-system
    /// cache in the background.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> io::Result<Self> {
        let disk = BlobStore::from_config(config)?;
        if let Some(disk) = &disk {
            disk.clear_tmp()?;
        }

        let memory = MemoryCache::new(
            &config.caches.in_memory,
            config.caches.disk.entry_lifetime,
        );

        let inner = Inner {
            memory,
            disk,
            inflight: InFlightRegistry::new(),
            transport,
            retry: RetryPolicy::from_config(&config.fetch),
            fetch_permits: Semaphore::new(config.fetch.max_concurrent_fetches.max(1)),
            timeout: config.fetch.timeout,
            runtime,
            maintenance_running: Default::default(),
            estimated_disk_size: Default::default(),
        };

        let coordinator = Self {
            inner: Arc::new(inner),
        };
        coordinator.inner.start_maintenance();

        Ok(coordinator)
    }

    /// Fetches the payload of `key`, performing `request` on a cache miss.
    ///
    /// The returned [`FetchHandle`] resolves to the payload, or the error of the fetch. All
    /// callers that are waiting for the same key at the same time receive the same result from a
    /// single transport fetch.
    pub fn fetch(
        &self,
        key: CacheKey,
        request: FetchRequest,
        options: FetchOptions,
    ) -> FetchHandle {
        metric!(counter("caches.access") += 1);

        if !options.use_cache {
            let waiter = self.inner.inflight.detached(&key);
            self.spawn_fetch(Arc::clone(waiter.pending()), request, false);
            return FetchHandle::waiting(waiter);
        }

        if let Some(entry) = self.inner.memory.get(&key) {
            metric!(counter("caches.memory.hit") += 1);
            tracing::debug!("In-memory hit for `{}`", key);
            return FetchHandle::ready(Ok(entry.payload));
        }

        let (is_owner, waiter) = self.inner.inflight.begin_or_join(&key);
        if is_owner {
            self.spawn_fetch(Arc::clone(waiter.pending()), request, true);
        } else {
            metric!(counter("caches.inflight.joined") += 1);
            tracing::debug!("Joined running fetch for `{}`", key);
        }

        FetchHandle::waiting(waiter)
    }

    /// Like [`fetch`](Self::fetch), but invokes `completion` with the result.
    ///
    /// `completion` is run on the runtime of the coordinator, possibly on another thread. It
    /// receives [`CacheError::Cancelled`] if the returned handle is used to retract the interest.
    pub fn fetch_with_callback<F>(
        &self,
        key: CacheKey,
        request: FetchRequest,
        options: FetchOptions,
        completion: F,
    ) -> CancelHandle
    where
        F: FnOnce(CacheContents) + Send + 'static,
    {
        let handle = self.fetch(key, request, options);
        let cancel_handle = handle.cancel_handle();
        self.inner
            .runtime
            .spawn(async move { completion(handle.await) });
        cancel_handle
    }

    /// Retracts the interest of the caller that most recently joined the running fetch of `key`.
    ///
    /// The fetch itself is aborted once no caller is interested anymore. Returns `false` if there
    /// is no running fetch for `key`.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        self.inner.inflight.cancel(key)
    }

    /// Removes all entries from both cache tiers.
    ///
    /// Running fetches are not affected and store their results once they complete.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.inner.memory.clear();

        if let Some(disk) = self.inner.disk.clone() {
            self.inner
                .runtime
                .spawn_blocking(move || disk.clear())
                .await??;
            self.inner.estimated_disk_size.store(0, Ordering::Relaxed);
        }

        tracing::info!("Cleared all caches");
        Ok(())
    }

    /// Releases the memory held by the in-memory cache.
    ///
    /// The file-system cache is not affected, so entries are promoted back into memory the next
    /// time they are requested.
    pub fn on_resource_pressure(&self) {
        let entries = self.inner.memory.entry_count();
        self.inner.memory.clear();
        tracing::info!("Dropped {} in-memory entries on resource pressure", entries);
    }

    /// Starts a maintenance pass of the file-system cache in the background.
    ///
    /// Returns `false` if there is no file-system cache, or a pass is already running.
    pub fn trigger_maintenance(&self) -> bool {
        self.inner.start_maintenance().is_some()
    }

    /// Runs a maintenance pass of the file-system cache and waits for it.
    ///
    /// Returns `None` if there is no file-system cache, a pass is already running, or the pass
    /// failed.
    pub async fn run_maintenance(&self) -> Option<CleanupStats> {
        let handle = self.inner.start_maintenance()?;
        match handle.await {
            Ok(stats) => stats,
            Err(err) => {
                log_join_error(err);
                None
            }
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        // entry counts lag behind until pending inserts and invalidations are applied
        self.inner.memory.run_pending_tasks();

        CoordinatorStats {
            memory_entries: self.inner.memory.entry_count(),
            memory_weight: self.inner.memory.weighted_size(),
            estimated_disk_bytes: self.inner.estimated_disk_size.load(Ordering::Relaxed),
            inflight: self.inner.inflight.len(),
        }
    }

    fn spawn_fetch(&self, pending: Arc<PendingFetch>, request: FetchRequest, use_cache: bool) {
        let inner = Arc::clone(&self.inner);

        // Fails the fetch if the task panics or is dropped before it completes, so that no
        // waiter is left behind on a dead fetch.
        let abandoned = {
            let inner = Arc::clone(&inner);
            let pending = Arc::clone(&pending);
            CallOnDrop::new(move || {
                tracing::error!("Fetch of `{}` terminated unexpectedly", pending.key());
                inner.inflight.complete(&pending, Err(CacheError::InternalError));
            })
        };

        self.inner.runtime.spawn(async move {
            let token = pending.token().clone();
            let load = measure(
                "fetch",
                m::cache_contents,
                inner.load(pending.key(), &request, use_cache),
            );

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Aborted fetch of `{}`", pending.key());
                    Err(CacheError::Cancelled)
                }
                result = load => result,
            };

            abandoned.disarm();
            let notified = inner.inflight.complete(&pending, result);
            tracing::trace!("Notified {} callers of `{}`", notified, pending.key());
        });
    }
}

impl Inner {
    async fn load(&self, key: &CacheKey, request: &FetchRequest, use_cache: bool) -> CacheContents {
        if use_cache {
            // another fetch might have completed since the caller looked
            if let Some(entry) = self.memory.get(key) {
                metric!(counter("caches.memory.hit") += 1);
                return Ok(entry.payload);
            }

            if let Some(entry) = self.read_disk(key).await {
                metric!(counter("caches.file.hit") += 1);
                tracing::debug!("File-system hit for `{}`", key);
                let payload = entry.payload.clone();
                self.memory.insert(key.clone(), entry);
                return Ok(payload);
            }
        }

        tracing::debug!("Fetching `{}` from `{}`", key, request.url);
        metric!(counter("caches.computation") += 1);
        let payload = self
            .retry
            .run(|attempt| self.attempt(request, attempt))
            .await?;

        if use_cache {
            self.store(key, &payload).await;
        }
        Ok(payload)
    }

    /// Performs a single transport attempt, bounded by the concurrency limit and the timeout.
    async fn attempt(
        &self,
        request: &FetchRequest,
        attempt: u32,
    ) -> Result<Response, TransportError> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::trace!(attempt, "Requesting `{}`", request.url);
        match tokio::time::timeout(self.timeout, self.transport.perform(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn read_disk(&self, key: &CacheKey) -> Option<CacheEntry> {
        let disk = self.disk.clone()?;
        let key = key.clone();

        match self.runtime.spawn_blocking(move || disk.read(&key)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(err)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to read cache file"
                );
                None
            }
            Err(err) => {
                log_join_error(err);
                None
            }
        }
    }

    /// Writes a fresh payload through to both cache tiers.
    ///
    /// Failing to write to the file-system is logged, but does not fail the fetch.
    async fn store(&self, key: &CacheKey, payload: &Bytes) {
        let entry = CacheEntry::fresh(payload.clone());
        self.memory.insert(key.clone(), entry.clone());

        let Some(disk) = self.disk.clone() else {
            return;
        };
        let size_limit = disk.size_limit();
        let key = key.clone();

        match self
            .runtime
            .spawn_blocking(move || disk.write(&key, &entry))
            .await
        {
            Ok(Ok(size)) => {
                metric!(counter("caches.file.write") += 1);
                metric!(time_raw("caches.file.size") = size);

                let estimate = self.estimated_disk_size.fetch_add(size, Ordering::Relaxed) + size;
                if estimate > size_limit {
                    tracing::debug!("File-system cache estimated at {} bytes", estimate);
                    self.start_maintenance();
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to write cache file"
                );
            }
            Err(err) => log_join_error(err),
        }
    }

    /// Spawns a maintenance pass, unless one is running already.
    fn start_maintenance(&self) -> Option<JoinHandle<Option<CleanupStats>>> {
        let disk = self.disk.clone()?;

        if self
            .maintenance_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Cache maintenance is already running");
            return None;
        }

        let running = Arc::clone(&self.maintenance_running);
        let estimate = Arc::clone(&self.estimated_disk_size);

        Some(self.runtime.spawn_blocking(move || {
            let _done = CallOnDrop::new(move || running.store(false, Ordering::Release));

            match disk.cleanup(false) {
                Ok(stats) => {
                    estimate.store(stats.retained_bytes, Ordering::Relaxed);
                    Some(stats)
                }
                Err(err) => {
                    let stderr: &dyn std::error::Error = &*err;
                    tracing::error!(stderr, "Failed to clean up cache");
                    None
                }
            }
        }))
    }
}

fn log_join_error(err: tokio::task::JoinError) {
    tracing::error!(error = &err as &dyn std::error::Error, "Cache task failed");
}
