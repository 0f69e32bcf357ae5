//! The Content Store: disk layout, metadata index, atomic write, eviction.

pub mod entry;
pub mod eviction;
pub mod layout;
pub mod store;

use std::{
    path::PathBuf,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};

use entry::Entry;
use layout::{Fingerprint, path_from_hash};
use store::{IndexStore, StoreError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("index store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A cache hit: the open file, its size, and its modification time.
pub struct Hit {
    pub file: tokio::fs::File,
    pub size: u64,
    pub mtime: i64,
}

/// Disk layout, metadata index, atomic-enough writes, and the eviction state
/// the scanner/evictor pair reads and drains. `Get`/`Set` never surface
/// errors to callers as anything other than "miss" or "save failed" — the
/// spec requires the process to stay up through disk and index trouble.
pub struct ContentStore {
    cache_dir: PathBuf,
    index: IndexStore,
    /// Running total of on-disk footprint, kept approximately in sync by
    /// `Set`/`Delete` and re-truthed by the scanner each tick.
    running_size: AtomicU64,
    limit_bytes: AtomicU64,
    refresh_age_seconds: AtomicI64,
}

impl ContentStore {
    pub fn open(cache_dir: PathBuf, limit_bytes: u64, refresh_age_seconds: i64) -> Result<Self, CacheError> {
        let index = IndexStore::open(cache_dir.join("cache.db"))?;
        Ok(Self {
            cache_dir,
            index,
            running_size: AtomicU64::new(0),
            limit_bytes: AtomicU64::new(limit_bytes),
            refresh_age_seconds: AtomicI64::new(refresh_age_seconds),
        })
    }

    pub fn running_size(&self) -> u64 {
        self.running_size.load(Ordering::Relaxed)
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes.load(Ordering::Relaxed)
    }

    /// Sets the eviction threshold observed by the eviction loop.
    pub fn update_limit(&self, bytes: u64) {
        self.limit_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Re-truths the running size counter. Called by the scanner after a
    /// full index walk.
    pub fn running_size_store(&self, bytes: u64) {
        self.running_size.store(bytes, Ordering::Relaxed);
    }

    /// Subtracts from the running size counter, saturating at zero. Called
    /// by the evictor as it deletes entries.
    pub fn running_size_sub(&self, bytes: u64) {
        self.running_size.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
            Some(cur.saturating_sub(bytes))
        }).ok();
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Looks up a fingerprint. Any failure along the way (missing file,
    /// missing entry, unreadable entry) collapses to `Ok(None)` — never a
    /// partial value, and never propagated as an error the caller must
    /// handle specially.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Hit> {
        let hash = fingerprint.hash();
        let (_, path) = path_from_hash(&self.cache_dir, &hash);

        let file = fs::File::open(&path).await.ok()?;
        let metadata = file.metadata().await.ok()?;
        let entry = self.index.get(&hash).ok().flatten()?;

        let refresh_age = self.refresh_age_seconds.load(Ordering::Relaxed);
        if entry.timestamp < Self::now() - refresh_age {
            let touched = Entry {
                timestamp: Self::now(),
                ..entry.clone()
            };
            if let Err(e) = self.index.put(&touched) {
                tracing::warn!(%hash, error = %e, "failed to touch cache entry on read");
            }
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(Self::now);

        Some(Hit {
            file,
            size: metadata.len(),
            mtime,
        })
    }

    /// Writes bytes for a fingerprint and records its metadata. Errors are
    /// logged and swallowed — an already-served response must not be
    /// retroactively affected by a failed save.
    pub async fn set(&self, fingerprint: &Fingerprint, mtime: i64, bytes: &[u8]) {
        if let Err(e) = self.try_set(fingerprint, mtime, bytes).await {
            tracing::warn!(fingerprint = %fingerprint.canonical(), error = %e, "failed to save cache entry");
        }
    }

    async fn try_set(&self, fingerprint: &Fingerprint, mtime: i64, bytes: &[u8]) -> Result<(), CacheError> {
        let hash = fingerprint.hash();
        let (dir, path) = path_from_hash(&self.cache_dir, &hash);

        fs::create_dir_all(&dir).await?;

        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        let mtime_system = std::time::UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
        let _ = filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(mtime_system));

        let entry = Entry {
            hash,
            timestamp: Self::now(),
            size: bytes.len() as u64,
        };
        self.index.put(&entry)?;
        self.running_size.fetch_add(entry.size, Ordering::Relaxed);

        Ok(())
    }

    /// Removes a blob and its index entry by hash, returning the bytes freed
    /// (if the entry was found). Missing file or entry is logged at warn,
    /// never fatal.
    pub async fn delete(&self, hash: &str) -> Option<u64> {
        let (_, path) = path_from_hash(&self.cache_dir, hash);
        let freed = self.index.get(hash).ok().flatten().map(|e| e.size);

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(hash, "blob file already absent during delete");
            }
            Err(e) => tracing::warn!(hash, error = %e, "failed to remove blob file"),
        }

        match self.index.delete(hash) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(hash, "index entry already absent during delete"),
            Err(e) => tracing::warn!(hash, error = %e, "failed to remove index entry"),
        }

        if let Some(bytes) = freed {
            self.running_size_sub(bytes);
        }

        freed
    }

    /// Full ordered walk of the index, bounded by `max_scan_time_seconds`.
    pub fn scan(&self, time_budget: Duration) -> Vec<Entry> {
        self.index.scan(time_budget)
    }

    /// Rewrites the index store more compactly. `sled`'s own compaction is
    /// triggered by a flush; see `store::IndexStore::compact`.
    pub fn compact(&self) -> Result<(), CacheError> {
        self.index.compact()?;
        Ok(())
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::parse("data", "0123456789abcdef0123456789abcdef", "1.jpg").unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().to_path_buf(), 1_000_000, 3600).unwrap();

        let fingerprint = fp();
        store.set(&fingerprint, 1_700_000_000, b"BYTES").await;

        let hit = store.get(&fingerprint).await.expect("expected cache hit");
        assert_eq!(hit.size, 5);
    }

    #[tokio::test]
    async fn missing_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().to_path_buf(), 1_000_000, 3600).unwrap();
        assert!(store.get(&fp()).await.is_none());
    }

    #[tokio::test]
    async fn delete_then_get_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().to_path_buf(), 1_000_000, 3600).unwrap();

        let fingerprint = fp();
        store.set(&fingerprint, 1_700_000_000, b"BYTES").await;
        store.delete(&fingerprint.hash()).await;

        assert!(store.get(&fingerprint).await.is_none());
    }
}
