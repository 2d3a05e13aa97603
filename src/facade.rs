//! Cached filesystem facade (component F): routes filesystem-level calls to
//! the pool or straight through to the origin. Ported from
//! `frontend/cached_fs.cpp`'s `CachedFs` and `cached_file.h`'s `CachedFile`.

use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::origin::OriginFs;
use crate::pool::FileCachePool;
use crate::store::{CacheStat, CacheStore};

/// Minimal metadata the facade can answer without a real directory-aware
/// origin filesystem: just the size the origin reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
}

/// Routes `open`/`unlink`/`rename` to the pool, and `stat`/`access`/
/// `opendir`/`readlink` toward the origin. The origin trait was
/// deliberately narrowed to `open`/`pread`/`fstat` (see `origin.rs`), so
/// directory-shaped queries have no backing implementation here and report
/// [`CacheError::Unsupported`] rather than silently returning nonsense.
pub struct CachedFileSystem {
    pool: Arc<FileCachePool>,
    origin_fs: Arc<dyn OriginFs>,
}

impl CachedFileSystem {
    pub fn new(pool: Arc<FileCachePool>, origin_fs: Arc<dyn OriginFs>) -> Self {
        Self { pool, origin_fs }
    }

    /// Obtain a store from the pool and wrap it in a handle that releases
    /// the pool's open count when dropped.
    pub async fn open(&self, path: &str, origin_url: &str) -> Result<CachedFile> {
        let store = self.pool.open(path, origin_url).await?;
        Ok(CachedFile {
            store,
            pool: Arc::clone(&self.pool),
            path: path.to_string(),
        })
    }

    /// Force-evict the backing file, independent of any open handles.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.pool.evict_by_name(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.pool.rename(from, to).await
    }

    pub async fn stat(&self, origin_url: &str) -> Result<FileStat> {
        let file = self.origin_fs.open(origin_url).await?;
        let size = file
            .fstat()
            .await?
            .ok_or_else(|| CacheError::Unsupported("origin did not report a content length".into()))?;
        Ok(FileStat { size })
    }

    pub async fn access(&self, origin_url: &str) -> Result<()> {
        self.origin_fs.open(origin_url).await.map(|_| ())
    }

    pub async fn opendir(&self, _path: &str) -> Result<Vec<String>> {
        Err(CacheError::Unsupported(
            "directory listing has no origin-filesystem equivalent over a narrow HTTP origin".into(),
        ))
    }

    pub async fn readlink(&self, _path: &str) -> Result<String> {
        Err(CacheError::Unsupported(
            "readlink has no origin-filesystem equivalent over a narrow HTTP origin".into(),
        ))
    }

    pub async fn cache_stat(&self, path_prefix: Option<&str>) -> CacheStat {
        self.pool.stat(path_prefix).await
    }
}

/// An open cache-backed file handle. Releases its open count back to the
/// pool on drop, mirroring `CachedFile`'s destructor calling
/// `cache_store->release()`.
pub struct CachedFile {
    store: CacheStore,
    pool: Arc<FileCachePool>,
    path: String,
}

impl CachedFile {
    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.store.preadv(buf, offset).await
    }

    pub async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let n = self.store.pwritev(buf, offset).await?;
        let new_size = self.store.stat().actual_size;
        self.pool.update_size(&self.path, new_size).await;
        Ok(n)
    }

    /// Warm a range without necessarily returning its bytes to a caller.
    pub async fn prefetch(&self, offset: u64, count: u64) -> Result<u64> {
        self.store.try_refill_range(offset, count).await
    }

    /// Drop `[offset, offset+count)` from the cache, punching a hole in the
    /// backing media file.
    pub async fn evict(&self, offset: u64, count: u64) -> Result<()> {
        self.store.evict(offset, count).await
    }

    /// Idempotent, read-only hole query: `(missing_offset, missing_length)`
    /// for the first uncovered sub-range within `[offset, offset+count)`, or
    /// `None` if it's all already cached. Never fetches or persists anything,
    /// so `prefetch(off, len)` followed by `evict(off, len)` followed by
    /// `query(off, len)` reports the same `(off, len)` hole it started with.
    pub fn query(&self, offset: u64, count: u64) -> Option<(u64, u64)> {
        self.store.query_refill_range(offset, count)
    }

    pub fn fstat(&self) -> CacheStat {
        self.store.stat()
    }

    pub async fn seal(&self, payload_size: u64) -> Result<()> {
        self.store.seal(payload_size).await?;
        let new_size = self.store.stat().actual_size;
        self.pool.update_size(&self.path, new_size).await;
        Ok(())
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let path = std::mem::take(&mut self.path);
        tokio::spawn(async move { pool.release(&path).await });
    }
}
