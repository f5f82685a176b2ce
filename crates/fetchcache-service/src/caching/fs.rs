use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::{Buf, Bytes};
use filetime::FileTime;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::Config;

use super::{CacheEntry, CacheKey};

/// Every cache file starts with this marker, followed by the length of the key as a little
/// endian `u32`, the key itself and finally the payload.
const MAGIC: &[u8] = b"fetchcache\x01";

/// A non-fatal failure of the file-system cache.
///
/// These are logged, but never fail a fetch.
#[derive(Debug, Error)]
#[error("storage failure at `{}`", path.display())]
pub struct StorageError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

impl StorageError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_owned(),
            source,
        }
    }
}

/// A cache file as seen by enumeration, without its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// The absolute path of the cache file, derived from the hash of its key.
    pub path: PathBuf,
    /// The size of the file in bytes, including its header.
    pub size: u64,
    /// The `mtime` of the file, which is the time its payload was fetched.
    pub modified: SystemTime,
}

/// The file-system cache tier.
///
/// Each [`CacheKey`] maps to one file under `cache_dir`, named by the hash of the key. The time
/// an entry was stored is kept as the `mtime` of its file, so enumerating and cleaning up the
/// cache never has to open any file.
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// Directory holding all the cache files.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// New cache files are fully written into a temporary file in this sibling directory, and
    /// then atomically moved to their location within [`cache_dir`](Self::cache_dir).
    tmp_dir: PathBuf,

    /// Time after which an entry is expired.
    pub(super) lifetime: Duration,

    /// Maximum total size of all cache files.
    pub(super) size_limit: u64,
}

impl BlobStore {
    /// Creates the file-system cache, or `None` if no `cache_dir` is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        let (Some(cache_dir), Some(tmp_dir)) = (config.cache_dir("blobs"), config.cache_dir("tmp"))
        else {
            return Ok(None);
        };

        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Some(Self {
            cache_dir,
            tmp_dir,
            lifetime: config.caches.disk.entry_lifetime,
            size_limit: config.caches.disk.size_limit,
        }))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Maximum total size of all cache files.
    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Clear the temporary files.
    ///
    /// This needs to happen on startup to avoid leaving temporary files which survive a hard
    /// crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // A concurrent `clear` could remove the directory we are operating in, so retry the fs
        // operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(path) {
                tracing::error!(
                    path = %path.display(),
                    "Failed to create cache directory: {:?}",
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to create cache file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// The path of the cache file of `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path())
    }

    /// Stores `entry` for `key`, replacing any previous file.
    ///
    /// Returns the size of the written file.
    pub fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<u64, StorageError> {
        let path = self.path_for(key);
        let mut temp_file = self
            .tempfile()
            .map_err(|e| StorageError::new(&self.tmp_dir, e))?;

        let key_bytes = key.as_str().as_bytes();
        let key_len = u32::try_from(key_bytes.len())
            .map_err(|e| StorageError::new(&path, io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let result: io::Result<()> = (|| {
            let file = temp_file.as_file_mut();
            file.write_all(MAGIC)?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key_bytes)?;
            file.write_all(&entry.payload)?;
            file.flush()?;
            // renaming keeps the mtime intact
            filetime::set_file_mtime(
                temp_file.path(),
                FileTime::from_system_time(entry.stored_at),
            )
        })();
        result.map_err(|e| StorageError::new(temp_file.path(), e))?;

        let size = (MAGIC.len() + 4 + key_bytes.len() + entry.payload.len()) as u64;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::new(parent, e))?;
        }
        temp_file
            .persist(&path)
            .map_err(|e| StorageError::new(&path, e.error))?;

        tracing::trace!("Wrote {} bytes to `{}`", size, path.display());
        Ok(size)
    }

    /// Reads the non-expired entry of `key`.
    ///
    /// Expired and corrupt files are misses and are removed.
    pub fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let path = self.path_for(key);

        let result = catch_not_found(|| {
            let mut file = File::open(&path)?;
            let stored_at = file.metadata()?.modified()?;

            if super::entry::is_expired(stored_at, self.lifetime, SystemTime::now()) {
                tracing::trace!("Cache file `{}` is expired", path.display());
                return Ok(ReadOutcome::Expired);
            }

            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;

            Ok(match parse_cache_file(Bytes::from(buf)) {
                Some((stored_key, payload)) if stored_key == key.as_str() => {
                    ReadOutcome::Hit(CacheEntry { payload, stored_at })
                }
                Some(_) => ReadOutcome::OtherKey,
                None => ReadOutcome::Corrupt,
            })
        })
        .map_err(|e| StorageError::new(&path, e))?;

        match result {
            None => Ok(None),
            Some(ReadOutcome::Hit(entry)) => Ok(Some(entry)),
            Some(ReadOutcome::OtherKey) => {
                tracing::warn!("Cache file `{}` belongs to another key", path.display());
                Ok(None)
            }
            Some(ReadOutcome::Expired) => {
                remove_file(&path)?;
                Ok(None)
            }
            Some(ReadOutcome::Corrupt) => {
                tracing::warn!("Removing corrupt cache file `{}`", path.display());
                remove_file(&path)?;
                Ok(None)
            }
        }
    }

    /// Removes the file of `key`, returning whether there was one.
    pub fn delete(&self, key: &CacheKey) -> Result<bool, StorageError> {
        remove_file(&self.path_for(key))
    }

    /// Lists all cache files along with their size and `mtime`.
    ///
    /// The contents of the files are never read.
    pub fn enumerate(&self) -> io::Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();
        enumerate_recursive(&self.cache_dir, &mut blobs)?;
        Ok(blobs)
    }

    /// The total size of all cache files in bytes.
    pub fn total_size(&self) -> io::Result<u64> {
        Ok(self.enumerate()?.iter().map(|blob| blob.size).sum())
    }

    /// Removes all cache files.
    pub fn clear(&self) -> io::Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
        }
        fs::create_dir_all(&self.cache_dir)
    }
}

enum ReadOutcome {
    Hit(CacheEntry),
    Expired,
    Corrupt,
    OtherKey,
}

/// Splits the contents of a cache file into its key and payload.
fn parse_cache_file(mut buf: Bytes) -> Option<(String, Bytes)> {
    if !buf.starts_with(MAGIC) {
        return None;
    }
    buf.advance(MAGIC.len());

    if buf.remaining() < 4 {
        return None;
    }
    let key_len = buf.get_u32_le() as usize;
    if buf.remaining() < key_len {
        return None;
    }
    let key = buf.split_to(key_len);
    let key = String::from_utf8(key.to_vec()).ok()?;

    Some((key, buf))
}

fn remove_file(path: &Path) -> Result<bool, StorageError> {
    catch_not_found(|| fs::remove_file(path))
        .map(|removed| removed.is_some())
        .map_err(|e| StorageError::new(path, e))
}

fn enumerate_recursive(directory: &Path, blobs: &mut Vec<StoredBlob>) -> io::Result<()> {
    let Some(entries) = catch_not_found(|| fs::read_dir(directory))? else {
        return Ok(());
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        // files can vanish while we are walking the directory
        let Some(metadata) = catch_not_found(|| entry.metadata())? else {
            continue;
        };

        if metadata.is_dir() {
            enumerate_recursive(&path, blobs)?;
        } else if metadata.is_file() {
            blobs.push(StoredBlob {
                path,
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }
    }

    Ok(())
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
