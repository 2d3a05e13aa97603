//! End-to-end scenarios over the public API: cold reads, unaligned tails,
//! concurrent overlapping readers, pressure bypass, eviction under
//! capacity, and tar-wrap transparency.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use stratacache::config::CacheConfig;
use stratacache::error::{CacheError, Result};
use stratacache::facade::CachedFileSystem;
use stratacache::media::LocalMediaFs;
use stratacache::origin::{OriginFile, OriginFs};
use stratacache::pool::FileCachePool;
use stratacache::store::CacheStore;
use stratacache::tar_frame::{self, TarFrame};

/// In-memory origin standing in for a remote registry blob store. Counts
/// how many ranges were actually fetched, so tests can assert on
/// single-fetch / locality behaviour.
struct MemOrigin {
    blobs: std::sync::Mutex<ahash::HashMap<String, Arc<Vec<u8>>>>,
    fetches: AtomicUsize,
}

impl MemOrigin {
    fn new() -> Self {
        use ahash::HashMapExt;
        Self {
            blobs: std::sync::Mutex::new(ahash::HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    fn put(&self, url: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(url.to_string(), Arc::new(data));
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

struct MemOriginFile {
    data: Arc<Vec<u8>>,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl OriginFile for MemOriginFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    async fn fstat(&self) -> Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }
}

#[async_trait]
impl OriginFs for MemOrigin {
    async fn open(&self, url: &str) -> Result<Arc<dyn OriginFile>> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CacheError::Origin(format!("no such blob: {url}")))?;
        Ok(Arc::new(MemOriginFile {
            data,
            fetches: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

async fn cache(dir: &std::path::Path, config: CacheConfig) -> (Arc<FileCachePool>, Arc<MemOrigin>) {
    let media_fs = Arc::new(LocalMediaFs::new(dir));
    let origin = Arc::new(MemOrigin::new());
    let pool = Arc::new(FileCachePool::new(media_fs, origin.clone(), &config));
    (pool, origin)
}

#[tokio::test]
async fn cold_read_aligned_fetches_a_full_refill_unit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.page_size = 4096;
    config.refill_unit = 4096;
    let (pool, origin) = cache(dir.path(), config).await;
    let data: Vec<u8> = (0..65536u32).map(|i| (i % 256) as u8).collect();
    origin.put("blob://a", data.clone());

    let fs = CachedFileSystem::new(pool, origin);
    let file = fs.open("layers/a", "blob://a").await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = file.pread(&mut buf, 0).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(&buf[..], &data[..4096]);
}

#[tokio::test]
async fn unaligned_tail_read_returns_exactly_available_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.page_size = 4096;
    config.refill_unit = 4096;
    let (pool, origin) = cache(dir.path(), config).await;
    let data = vec![7u8; 5000];
    origin.put("blob://tail", data.clone());

    let fs = CachedFileSystem::new(pool, origin);
    let file = fs.open("layers/tail", "blob://tail").await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = file.pread(&mut buf, 3000).await.unwrap();
    assert_eq!(n, 2000);
    assert!(buf[..2000].iter().all(|&b| b == 7));
}

#[tokio::test]
async fn concurrent_overlapping_readers_share_a_single_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.page_size = 4096;
    config.refill_unit = 65536;
    let (pool, origin) = cache(dir.path(), config).await;
    let data: Vec<u8> = (0..65536u32).map(|i| (i % 256) as u8).collect();
    origin.put("blob://shared", data.clone());

    let fs = Arc::new(CachedFileSystem::new(pool, origin));
    let file = Arc::new(fs.open("layers/shared", "blob://shared").await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let file = Arc::clone(&file);
        let expected = data[10_000..11_000].to_vec();
        handles.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 1000];
            let n = file.pread(&mut buf, 10_000).await.unwrap();
            assert_eq!(n, 1000);
            assert_eq!(buf, expected);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn pressure_bypass_serves_reads_straight_from_origin() {
    // Pin the shared in-flight-refill counter above the store's threshold
    // before reading, so the read deterministically takes the pressure
    // bypass path (straight origin reads, no media file write) rather than
    // racing a background refill to prove it.
    let dir = tempfile::tempdir().unwrap();
    let media_fs = LocalMediaFs::new(dir.path());
    let media_file = media_fs.open_rw("layers/bypass").await.unwrap();
    let data: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();
    let origin = Arc::new(MemOrigin::new());
    origin.put("blob://bypass", data.clone());

    let refilling = Arc::new(AtomicU32::new(5));
    let store = CacheStore::new(
        media_file,
        origin,
        "blob://bypass",
        TarFrame::raw(),
        4096,
        4096,
        refilling,
        0, // threshold: any in-flight refill counts as pressure
        128,
    );
    store.set_actual_size(data.len() as u64);

    let mut buf = vec![0u8; 100];
    let n = store.preadv(&mut buf, 200).await.unwrap();
    assert_eq!(n, 100);
    assert_eq!(&buf[..], &data[200..300]);

    // Bypass reads never touch the media file.
    let on_disk = tokio::fs::metadata(dir.path().join("layers/bypass")).await.unwrap();
    assert_eq!(on_disk.len(), 0);
}

#[tokio::test]
async fn eviction_under_pressure_drops_the_coldest_closed_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.page_size = 4096;
    config.refill_unit = 4096;
    // Force the pool's capacity down to nothing so the very next eviction
    // pass reclaims anything not currently open, regardless of real size.
    config.registry_cache_size_gb = 0;
    config.free_space_floor = 0;
    let (pool, origin) = cache(dir.path(), config).await;
    origin.put("blob://old", vec![1u8; 4096]);
    origin.put("blob://new", vec![2u8; 4096]);

    let fs = CachedFileSystem::new(Arc::clone(&pool), origin);
    {
        let old = fs.open("layers/old", "blob://old").await.unwrap();
        let mut buf = [0u8; 4096];
        old.pread(&mut buf, 0).await.unwrap();
    }
    // `old`'s handle just dropped; its pool release is spawned rather than
    // awaited (see `facade::CachedFile`'s `Drop` impl), so give that task a
    // turn before relying on the open count being back to zero.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    pool.run_eviction_pass().await;
    assert!(!dir.path().join("layers/old").exists());

    let new = fs.open("layers/new", "blob://new").await.unwrap();
    let mut buf = [0u8; 4096];
    new.pread(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..], &[2u8; 4096][..]);
}

#[tokio::test]
async fn tar_wrapped_blob_reads_transparently_at_logical_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let media_fs = Arc::new(LocalMediaFs::new(dir.path()));
    let payload = b"the quick brown fox jumps over the lazy dog".to_vec();

    // First pass: write a tar-framed blob directly against the store layer,
    // sealing it once the payload length is known.
    {
        let media_file = media_fs.open_rw("layers/tar-blob").await.unwrap();
        TarFrame::write_sentinel(media_file.as_ref()).await.unwrap();
        let frame = TarFrame { header_bytes: 512 };
        let origin = Arc::new(MemOrigin::new());
        let store = CacheStore::new(
            media_file,
            origin,
            "blob://tar-blob",
            frame,
            4096,
            4096,
            Arc::new(AtomicU32::new(0)),
            32,
            128,
        );
        let n = store.pwritev(&payload, 0).await.unwrap();
        assert_eq!(n, payload.len());
        store.seal(payload.len() as u64).await.unwrap();
    }

    // Second pass: reopen the same on-disk file and confirm `recognize`
    // reports the payload length (not the physical header+trailer size),
    // and a fresh store reads the same bytes back at logical offset 0.
    let media_file2 = media_fs.open_rw("layers/tar-blob").await.unwrap();
    let recognition = tar_frame::recognize(media_file2.as_ref()).await.unwrap();
    let (header_bytes, payload_size) = match recognition {
        tar_frame::Recognition::Framed { header_bytes, payload_size } => (header_bytes, payload_size),
        _ => panic!("expected a framed recognition on the sealed file"),
    };
    assert_eq!(payload_size, payload.len() as u64);

    // The origin serves the same tar-wrapped bytes as the local cache file
    // (this models an overlaybd layer blob, which is itself a one-entry tar
    // archive) — both sides shift by `header_bytes`, so the origin fetch
    // must be seeded with the physical bytes, not the bare payload.
    let physical_bytes = tokio::fs::read(dir.path().join("layers/tar-blob")).await.unwrap();
    let origin2 = Arc::new(MemOrigin::new());
    origin2.put("blob://tar-blob", physical_bytes);
    let store2 = CacheStore::new(
        media_file2,
        origin2,
        "blob://tar-blob",
        TarFrame { header_bytes },
        4096,
        4096,
        Arc::new(AtomicU32::new(0)),
        32,
        128,
    );
    store2.set_actual_size(payload_size);

    let mut buf = vec![0u8; payload.len()];
    let n = store2.preadv(&mut buf, 0).await.unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(buf, payload);
}
