use std::time::{Duration, Instant, SystemTime};

use crate::config::InMemoryCacheConfig;

use super::{CacheEntry, CacheKey};

type InMemoryCache = moka::sync::Cache<CacheKey, CacheEntry>;

/// A struct implementing [`moka::Expiry`] that expires items `lifetime` after their
/// [`CacheEntry::stored_at`] time.
struct CacheExpiration {
    lifetime: Duration,
}

impl CacheExpiration {
    fn remaining(&self, entry: &CacheEntry) -> Option<Duration> {
        let deadline = entry.expires_at(self.lifetime)?;
        Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or_default(),
        )
    }
}

impl moka::Expiry<CacheKey, CacheEntry> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        self.remaining(value)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        self.remaining(value)
    }
}

/// The in-memory cache tier.
///
/// This is bounded both in the number of entries and in the summed payload size. Both bounds are
/// enforced through a single moka weight: every entry weighs at least `cost_limit / count_limit`,
/// so no more than `count_limit` entries fit into the `cost_limit` capacity. Eviction follows
/// moka's admission and eviction policy, which is not strict LRU.
///
/// The cache is internally synchronized and can be shared between threads.
#[derive(Clone)]
pub struct MemoryCache {
    cache: InMemoryCache,
    lifetime: Duration,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl MemoryCache {
    pub fn new(config: &InMemoryCacheConfig, lifetime: Duration) -> Self {
        let count_limit = config.count_limit.max(1);
        let min_weight = config.cost_limit.div_ceil(count_limit).max(1);
        let min_weight = u32::try_from(min_weight).unwrap_or(u32::MAX);

        let cache = InMemoryCache::builder()
            .name("fetchcache")
            .max_capacity(config.cost_limit)
            .expire_after(CacheExpiration { lifetime })
            .weigher(move |_k, v: &CacheEntry| {
                let size = u32::try_from(v.size_bytes()).unwrap_or(u32::MAX);
                size.max(min_weight)
            })
            .build();

        Self { cache, lifetime }
    }

    /// Looks up a non-expired entry.
    ///
    /// An expired entry is a miss and is invalidated right away.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.cache.get(key)?;
        if entry.is_expired(self.lifetime, SystemTime::now()) {
            tracing::trace!("Expired in-memory entry for `{key}`");
            self.cache.invalidate(key);
            return None;
        }
        Some(entry)
    }

    /// Inserts `entry`, replacing any previous entry of `key`.
    ///
    /// Entries that are already expired are not inserted.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        if entry.is_expired(self.lifetime, SystemTime::now()) {
            return;
        }
        self.cache.insert(key, entry);
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// The (approximate) number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// The (approximate) summed weight of all entries.
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Applies pending evictions, which moka otherwise performs lazily.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}
