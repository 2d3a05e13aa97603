use std::path::PathBuf;
use std::time::Duration;

/// How the media filesystem adapter performs its I/O. Only affects the
/// local media file adapter — origin and cache-logic code is unaffected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoEngine {
    Synchronous,
    KernelAsync,
}

/// Throttling knobs for origin traffic.
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    pub enable: bool,
    pub delay: Duration,
    pub delay_extra: Duration,
    pub max_mbps: u32,
    pub try_cnt: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enable: true,
            delay: Duration::from_millis(0),
            delay_extra: Duration::from_millis(0),
            max_mbps: 0, // 0 == unbounded
            try_cnt: 3,
        }
    }
}

/// The configuration surface recognised by the cache (registryCacheDir,
/// registryCacheSizeGB, ioEngine, download.*, logLevel). Programmatic only —
/// loading this from a file or the command line is out of scope, mirroring
/// the teacher's plain-struct-plus-builder configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub registry_cache_dir: PathBuf,
    pub registry_cache_size_gb: u64,
    pub io_engine: IoEngine,
    pub download: DownloadConfig,
    pub log_level: u8,
    pub page_size: u64,
    pub refill_unit: u64,
    pub free_space_floor: u64,
    pub refill_threshold: u32,
    pub refill_cap: u32,
    pub eviction_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            registry_cache_dir: PathBuf::from("/opt/overlaybd/registryfs_cache"),
            registry_cache_size_gb: 4,
            io_engine: IoEngine::Synchronous,
            download: DownloadConfig::default(),
            log_level: 2,
            page_size: 4096,
            refill_unit: 256 * 1024,
            free_space_floor: 1024 * 1024 * 1024,
            refill_threshold: 32,
            refill_cap: 128,
            eviction_period: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.registry_cache_size_gb * 1024 * 1024 * 1024
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn registry_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.registry_cache_dir = dir.into();
        self
    }

    pub fn registry_cache_size_gb(mut self, size_gb: u64) -> Self {
        self.config.registry_cache_size_gb = size_gb.max(1);
        self
    }

    pub fn io_engine(mut self, engine: IoEngine) -> Self {
        self.config.io_engine = engine;
        self
    }

    pub fn download(mut self, download: DownloadConfig) -> Self {
        self.config.download = download;
        self
    }

    pub fn log_level(mut self, level: u8) -> Self {
        self.config.log_level = level.min(5);
        self
    }

    pub fn page_size(mut self, size: u64) -> Self {
        self.config.page_size = size.max(1);
        self
    }

    pub fn refill_unit(mut self, unit: u64) -> Self {
        self.config.refill_unit = unit.max(self.config.page_size);
        self
    }

    pub fn free_space_floor(mut self, floor: u64) -> Self {
        self.config.free_space_floor = floor;
        self
    }

    pub fn refill_threshold(mut self, threshold: u32) -> Self {
        self.config.refill_threshold = threshold;
        self
    }

    pub fn refill_cap(mut self, cap: u32) -> Self {
        self.config.refill_cap = cap.max(1);
        self
    }

    pub fn eviction_period(mut self, period: Duration) -> Self {
        self.config.eviction_period = period;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
