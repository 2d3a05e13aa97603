//! Process-wide file cache pool (component E): path → store map, capacity
//! accounting, periodic LRU eviction, and refill throttling shared across
//! every store. Ported from `cache_pool.h`'s `FileCachePool`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lru::LruRing;
use crate::media::MediaFs;
use crate::origin::OriginFs;
use crate::store::{CacheStat, CacheStore};
use crate::tar_frame::{self, TarFrame};

const WATER_MARK_RATIO: u64 = 90;

struct PoolEntry {
    path: String,
    store: CacheStore,
    size_units: u64,
}

/// Pinned (open) entries are detached from the LRU ring via
/// [`LruRing::mark_cleared`] and re-attached via [`LruRing::reattach`] once
/// their open count drops back to zero — mirroring `removeOpenFile`/
/// `updateLru`.
struct LruState {
    ring: LruRing<PoolEntry>,
    keys_by_path: ahash::HashMap<String, u32>,
    open_counts: ahash::HashMap<String, u32>,
    total_used_units: u64,
}

pub struct FileCachePool {
    media_fs: Arc<dyn MediaFs>,
    origin_fs: Arc<dyn OriginFs>,
    refill_unit: u64,
    page_size: u64,
    water_mark_units: u64,
    risk_mark_units: u64,
    /// Accepted for configuration compatibility; free-space pressure would
    /// need a `statvfs`-style call that the narrow `MediaFs` trait doesn't
    /// expose, so only the unit-based water/risk marks are enforced here.
    #[allow(dead_code)]
    free_space_floor: u64,
    refilling: Arc<AtomicU32>,
    refill_threshold: u32,
    refill_cap: u32,
    lru: tokio::sync::Mutex<LruState>,
    full: std::sync::atomic::AtomicBool,
}

impl FileCachePool {
    pub fn new(media_fs: Arc<dyn MediaFs>, origin_fs: Arc<dyn OriginFs>, config: &CacheConfig) -> Self {
        let capacity_units = config.capacity_bytes() / config.refill_unit.max(1);
        let water_mark_units = calc_water_mark(capacity_units, WATER_MARK_RATIO);
        let risk_mark_units = capacity_units;
        Self {
            media_fs,
            origin_fs,
            refill_unit: config.refill_unit,
            page_size: config.page_size,
            water_mark_units,
            risk_mark_units,
            free_space_floor: config.free_space_floor,
            refilling: Arc::new(AtomicU32::new(0)),
            refill_threshold: config.refill_threshold,
            refill_cap: config.refill_cap,
            lru: tokio::sync::Mutex::new(LruState {
                ring: LruRing::new(),
                keys_by_path: ahash::HashMap::default(),
                open_counts: ahash::HashMap::default(),
                total_used_units: 0,
            }),
            full: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Walk the media root and seed the map/LRU from files already on disk,
    /// so a restarted process doesn't treat everything as a cold cache.
    pub async fn warm_from_disk(&self) -> Result<usize> {
        let mut n = 0;
        for path in self.media_fs.walk().await? {
            if self.open(&path, &format!("warm://{path}")).await.is_ok() {
                self.release(&path).await;
                n += 1;
            }
        }
        info!(files = n, "warmed cache pool from disk");
        Ok(n)
    }

    /// Open (creating if absent) the store backing `path`, bumping its open
    /// count and moving it out of eviction eligibility.
    pub async fn open(&self, path: &str, origin_url: &str) -> Result<CacheStore> {
        let mut lru = self.lru.lock().await;

        if let Some(&key) = lru.keys_by_path.get(path) {
            let first_open = {
                let count = lru.open_counts.entry(path.to_string()).or_insert(0);
                *count += 1;
                *count == 1
            };
            if first_open {
                lru.ring.mark_cleared(key);
            }
            let store = lru.ring.get(key).expect("lru key must be valid while mapped").store.clone();
            return Ok(store);
        }

        if self.full.load(Ordering::Relaxed) {
            return Err(CacheError::NoSpace);
        }

        let media_file = self.media_fs.open_rw(path).await?;
        let physical_size = self.media_fs.lstat(path).await.map(|s| s.size).unwrap_or(0);
        // `actual_size` is the logical (unwrapped) blob length a caller reads
        // against; for a tar-framed file that's the payload size, not the
        // raw on-disk size which also counts the header/trailer blocks.
        let (frame, logical_size) = match tar_frame::recognize(media_file.as_ref()).await {
            Ok(tar_frame::Recognition::Framed { header_bytes, payload_size }) => {
                (TarFrame { header_bytes }, payload_size)
            }
            Ok(tar_frame::Recognition::Unwritten) => (TarFrame { header_bytes: 512 }, 0),
            Ok(tar_frame::Recognition::Raw) | Err(_) => (TarFrame::raw(), physical_size),
        };

        let store = CacheStore::new(
            media_file,
            Arc::clone(&self.origin_fs),
            origin_url,
            frame,
            self.page_size,
            self.refill_unit,
            Arc::clone(&self.refilling),
            self.refill_threshold,
            self.refill_cap,
        );

        store.set_actual_size(logical_size);
        let size_units = physical_size.div_ceil(self.refill_unit.max(1));

        let key = lru.ring.push_front(PoolEntry {
            path: path.to_string(),
            store: store.clone(),
            size_units,
        });
        lru.ring.mark_cleared(key);
        lru.keys_by_path.insert(path.to_string(), key);
        lru.open_counts.insert(path.to_string(), 1);
        lru.total_used_units += size_units;

        Ok(store)
    }

    /// Release one open reference to `path`. Once the count drops to zero
    /// the entry re-enters the LRU ring, eligible for eviction again.
    pub async fn release(&self, path: &str) {
        let mut lru = self.lru.lock().await;
        let Some(&key) = lru.keys_by_path.get(path) else {
            return;
        };
        let Some(count) = lru.open_counts.get_mut(path) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            lru.ring.reattach(key);
        }
    }

    pub async fn update_size(&self, path: &str, new_size_bytes: u64) {
        let mut lru = self.lru.lock().await;
        let Some(&key) = lru.keys_by_path.get(path) else {
            return;
        };
        let new_units = new_size_bytes.div_ceil(self.refill_unit.max(1));
        if let Some(entry) = lru.ring.get_mut(key) {
            lru.total_used_units = lru.total_used_units.saturating_sub(entry.size_units) + new_units;
            entry.size_units = new_units;
        }
    }

    pub async fn stat(&self, path_prefix: Option<&str>) -> CacheStat {
        let lru = self.lru.lock().await;
        let mut total = CacheStat::default();
        for (path, &key) in lru.keys_by_path.iter() {
            if let Some(prefix) = path_prefix
                && !path.starts_with(prefix)
            {
                continue;
            }
            if let Some(entry) = lru.ring.get(key) {
                let s = entry.store.stat();
                total.cached_size += s.cached_size;
                total.actual_size += s.actual_size;
            }
        }
        total
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.media_fs.rename(from, to).await?;
        let mut lru = self.lru.lock().await;
        if let Some(key) = lru.keys_by_path.remove(from) {
            lru.keys_by_path.insert(to.to_string(), key);
            if let Some(count) = lru.open_counts.remove(from) {
                lru.open_counts.insert(to.to_string(), count);
            }
            if let Some(entry) = lru.ring.get_mut(key) {
                entry.path = to.to_string();
            }
        }
        Ok(())
    }

    /// Unconditionally drop `path`'s backing file, independent of LRU order
    /// or open count.
    pub async fn evict_by_name(&self, path: &str) -> Result<()> {
        let mut lru = self.lru.lock().await;
        if let Some(key) = lru.keys_by_path.remove(path) {
            lru.open_counts.remove(path);
            if let Some(entry) = lru.ring.remove(key) {
                lru.total_used_units = lru.total_used_units.saturating_sub(entry.size_units);
            }
        }
        drop(lru);
        self.media_fs.unlink(path).await
    }

    fn is_over_water_mark(&self, lru: &LruState) -> bool {
        lru.total_used_units > self.water_mark_units
    }

    fn should_enter_eviction(&self, lru: &LruState) -> bool {
        lru.total_used_units >= self.risk_mark_units
    }

    /// One pass of the periodic eviction loop. Pops the LRU back repeatedly;
    /// entries still open (detached via `mark_cleared`, so never surfaced by
    /// `pop_back`) are simply never selected.
    pub async fn run_eviction_pass(&self) {
        let mut lru = self.lru.lock().await;
        if !self.should_enter_eviction(&lru) {
            self.full.store(false, Ordering::Relaxed);
            return;
        }

        let mut recovered = false;
        while self.is_over_water_mark(&lru) {
            let Some(entry) = lru.ring.pop_back() else {
                break;
            };
            recovered = true;
            lru.keys_by_path.remove(&entry.path);
            lru.open_counts.remove(&entry.path);
            lru.total_used_units = lru.total_used_units.saturating_sub(entry.size_units);
            drop(lru);
            if let Err(e) = self.media_fs.unlink(&entry.path).await {
                warn!(error = %e, path = %entry.path, "eviction unlink failed");
            }
            lru = self.lru.lock().await;
        }

        self.full.store(!recovered && self.is_over_water_mark(&lru), Ordering::Relaxed);
    }

    /// Spawn the periodic eviction timer. Returns a handle the caller can
    /// abort on shutdown.
    pub fn spawn_eviction_loop(self: Arc<Self>, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.run_eviction_pass().await;
            }
        })
    }

    pub fn refill_pressure(&self) -> u32 {
        self.refilling.load(Ordering::Relaxed)
    }
}

fn calc_water_mark(capacity_units: u64, ratio: u64) -> u64 {
    (capacity_units * ratio) / 100
}
