use std::fs::{read_dir, remove_dir};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::entry::is_expired;
use super::fs::{catch_not_found, BlobStore, StoredBlob};

/// Entry function for the cleanup command.
///
/// This will clean up the file-system cache based on the configured lifetime and size limit.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    BlobStore::from_config(config)?
        .ok_or_else(|| {
            anyhow!("no caching configured! Did you provide a path to your config file?")
        })?
        .cleanup(dry_run)
}

/// The share of the size limit (in percent) a cache above its limit is shrunk to.
const TARGET_PERCENT: u128 = 80;

/// Decides which cache files to remove during maintenance.
///
/// Files older than the entry lifetime are always removed. If the remaining files exceed the
/// size limit, the oldest ones are removed until the total is at 80% of the limit, which leaves
/// some headroom until the next maintenance pass is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub lifetime: Duration,
    pub size_limit: u64,
}

/// The outcome of [`EvictionPolicy::plan`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Files that outlived the entry lifetime.
    pub expired: Vec<StoredBlob>,
    /// Files removed to get back below the size limit, oldest first.
    pub evicted: Vec<StoredBlob>,
    /// Files that stay.
    pub retained: Vec<StoredBlob>,
}

impl EvictionPlan {
    /// All files that should be removed.
    pub fn removals(&self) -> impl Iterator<Item = &StoredBlob> {
        self.expired.iter().chain(self.evicted.iter())
    }

    pub fn retained_bytes(&self) -> u64 {
        self.retained.iter().map(|blob| blob.size).sum()
    }
}

impl EvictionPolicy {
    /// The total size a cache above its limit is shrunk to.
    pub fn target(&self) -> u64 {
        (self.size_limit as u128 * TARGET_PERCENT / 100) as u64
    }

    /// Partitions `blobs` into expired, evicted and retained files as of `now`.
    pub fn plan(&self, blobs: Vec<StoredBlob>, now: SystemTime) -> EvictionPlan {
        let (expired, mut retained): (Vec<_>, Vec<_>) = blobs
            .into_iter()
            .partition(|blob| is_expired(blob.modified, self.lifetime, now));

        let mut total: u64 = retained.iter().map(|blob| blob.size).sum();
        let mut evicted = Vec::new();

        if total > self.size_limit {
            // ties are broken by path so the outcome does not depend on enumeration order
            retained.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

            let target = self.target();
            let mut split = 0;
            for blob in &retained {
                if total <= target {
                    break;
                }
                total -= blob.size;
                split += 1;
            }
            evicted = retained.drain(..split).collect();
        }

        EvictionPlan {
            expired,
            evicted,
            retained,
        }
    }
}

/// Statistics of one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl BlobStore {
    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            lifetime: self.lifetime,
            size_limit: self.size_limit,
        }
    }

    /// Removes expired files and shrinks the cache if it exceeds its size limit.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up cache at `{}`", self.cache_dir().display());

        let blobs = self.enumerate()?;
        let plan = self.eviction_policy().plan(blobs, SystemTime::now());

        let mut stats = CleanupStats {
            retained_files: plan.retained.len(),
            retained_bytes: plan.retained_bytes(),
            ..Default::default()
        };

        for blob in plan.removals() {
            tracing::debug!("Removing file `{}`", blob.path.display());
            if !dry_run {
                if let Err(e) = catch_not_found(|| std::fs::remove_file(&blob.path)) {
                    tracing::error!(
                        path = %blob.path.display(),
                        "Failed to clean cache file: {:?}",
                        e
                    );
                    stats.retained_files += 1;
                    stats.retained_bytes += blob.size;
                    continue;
                }
            }
            stats.removed_files += 1;
            stats.removed_bytes += blob.size;
        }

        if !dry_run {
            remove_empty_dirs(self.cache_dir(), &mut stats)?;
        }

        tracing::info!("Cleaning up cache complete");
        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes ({} expired, {} evicted)",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes,
            plan.expired.len(),
            plan.evicted.len(),
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

/// Removes empty directories below `directory`, returning `true` if it is left empty.
fn remove_empty_dirs(directory: &Path, stats: &mut CleanupStats) -> io::Result<bool> {
    let Some(entries) = catch_not_found(|| read_dir(directory))? else {
        return Ok(true);
    };

    let mut is_empty = true;
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            is_empty = false;
            continue;
        }

        let mut dir_is_empty = remove_empty_dirs(&path, stats)?;
        if dir_is_empty {
            tracing::debug!("Removing directory `{}`", path.display());
            if let Err(e) = remove_dir(&path) {
                tracing::error!(path = %path.display(), "Failed to clean cache directory: {:?}", e);
                dir_is_empty = false;
            } else {
                stats.removed_dirs += 1;
            }
        }
        is_empty &= dir_is_empty;
    }

    Ok(is_empty)
}
