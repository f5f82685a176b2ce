use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The version of the on-disk layout, part of every cache path.
const CACHE_VERSION: u32 = 1;

/// A stable identifier of a fetched resource.
///
/// The key is used as-is for the in-memory cache, and its SHA-256 hash names the file in the
/// file-system cache. Equality and hashing only consider the hash.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    key: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from an opaque key string.
    pub fn new(key: impl Into<String>) -> Self {
        let key: String = key.into();
        let hash = Sha256::digest(key.as_bytes()).into();
        Self {
            key: key.into(),
            hash,
        }
    }

    /// Creates a [`CacheKey`] from the canonical form of `url`.
    ///
    /// Parsing already lowercases scheme and host and drops default ports, in addition the
    /// fragment is removed as it is never sent to a server.
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self::new(String::from(url))
    }

    /// Returns the key string this [`CacheKey`] was created from.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the relative path of the cache file for this key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        format!(
            "v{CACHE_VERSION}/{}/{}/{}",
            hex::encode(&self.hash[..1]),
            hex::encode(&self.hash[1..4]),
            hex::encode(&self.hash[4..]),
        )
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}
