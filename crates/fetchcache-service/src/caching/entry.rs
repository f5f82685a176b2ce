use std::time::{Duration, SystemTime};

use bytes::Bytes;

/// A payload held by one of the cache tiers.
///
/// Every tier holds its own copy. The payload buffer itself is immutable and cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The opaque payload.
    pub payload: Bytes,
    /// When the payload was fetched from the transport.
    pub stored_at: SystemTime,
}

impl CacheEntry {
    /// Creates an entry for a freshly fetched payload.
    pub fn fresh(payload: Bytes) -> Self {
        Self {
            payload,
            stored_at: SystemTime::now(),
        }
    }

    /// The size of the payload in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// The point in time at which this entry expires given the entry `lifetime`.
    ///
    /// Lifetimes that overflow the clock never expire.
    pub fn expires_at(&self, lifetime: Duration) -> Option<SystemTime> {
        self.stored_at.checked_add(lifetime)
    }

    /// Whether this entry is expired at `now`.
    pub fn is_expired(&self, lifetime: Duration, now: SystemTime) -> bool {
        is_expired(self.stored_at, lifetime, now)
    }
}

/// Whether something stored at `stored_at` is expired at `now`.
///
/// An entry is usable for exactly `lifetime`, it is a miss from `stored_at + lifetime` on.
pub(crate) fn is_expired(stored_at: SystemTime, lifetime: Duration, now: SystemTime) -> bool {
    match stored_at.checked_add(lifetime) {
        Some(deadline) => now >= deadline,
        None => false,
    }
}
