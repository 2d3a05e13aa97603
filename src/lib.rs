//! # stratacache
//!
//! A read-through, persistent, content-aware cache for container image layer
//! blobs. It sits between a filesystem frontend and a remote origin: reads
//! either land in the local cache file or trigger an aligned refill from the
//! origin, writes extend the cache in place, and a background eviction loop
//! keeps the cache directory under its configured size.
//!
//! ## Basic usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratacache::config::CacheConfig;
//! use stratacache::facade::CachedFileSystem;
//! use stratacache::media::LocalMediaFs;
//! use stratacache::origin::HttpOriginFs;
//! use stratacache::origin::OriginConfig;
//! use stratacache::pool::FileCachePool;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::builder()
//!     .registry_cache_dir("/var/cache/stratacache")
//!     .registry_cache_size_gb(20)
//!     .build();
//!
//! let media_fs = Arc::new(LocalMediaFs::new(config.registry_cache_dir.clone()));
//! let origin_fs = Arc::new(HttpOriginFs::new(OriginConfig::default()));
//! let pool = Arc::new(FileCachePool::new(media_fs, origin_fs.clone(), &config));
//! Arc::clone(&pool).spawn_eviction_loop(config.eviction_period);
//!
//! let fs = CachedFileSystem::new(pool, origin_fs);
//! let file = fs.open("layers/sha256:abc", "https://registry.example.com/blobs/abc").await?;
//! let mut buf = vec![0u8; 4096];
//! file.pread(&mut buf, 0).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## What it does
//!
//! - Serves reads out of a local cache file, refilling only the ranges a
//!   caller actually touches, aligned to a fixed page size.
//! - Tracks which byte ranges are resident per file so a refill never
//!   re-fetches data it already has.
//! - Locks in-flight byte ranges per file so concurrent overlapping readers
//!   share one fetch instead of racing duplicate requests to the origin.
//! - Evicts the coldest entries under a `tokio::sync::Mutex`-guarded LRU ring
//!   when the cache directory approaches its configured capacity.
//! - Optionally unwraps a tar envelope transparently, so a cached blob that
//!   is itself a single-file tar archive reads and writes at its logical
//!   (unwrapped) offsets.
//! - Can materialise a tar layer into a local directory tree, including
//!   OverlayFS whiteout semantics (`.wh.*`, `.wh..wh..opq`).
//!
//! ## Using it from C
//!
//! Build with `--features capi` to get C bindings:
//!
//! ```c
//! #include <stratacache.h>
//!
//! StrataFilesystem* fs = strata_create("/var/cache/stratacache", 20);
//! if (!fs) {
//!     fprintf(stderr, "Error: %s\n", strata_last_error());
//!     return 1;
//! }
//!
//! StrataFile* file = strata_open(fs, "layers/sha256:abc", "https://registry.example.com/blobs/abc");
//! char buffer[4096];
//! ssize_t bytes_read = strata_read(file, buffer, sizeof(buffer));
//!
//! strata_file_close(file);
//! strata_filesystem_free(fs);
//! ```
//!
//! ## Errors
//!
//! - Alignment errors: an operation that requires page-aligned offsets or
//!   lengths was given unaligned ones.
//! - No space: the cache directory cannot make room even after evicting.
//! - Origin errors: the remote fetch failed (network, non-2xx, missing
//!   range support).
//! - Checksum mismatch: a tar header's checksum does not match its bytes.
//! - Unsupported: an operation with no meaning over the narrow origin
//!   abstraction (directory listing, symlink targets).
//! - File closed: an operation was attempted on a handle past its lifetime.
//!
//! ## Feature flags
//!
//! - `curl` (default): use libcurl for the origin's HTTP transport.
//! - `reqwest`: use reqwest instead of curl (don't enable both).
//! - `capi`: build the C API.

pub mod config;
pub mod error;
pub mod extractor;
pub mod facade;
pub mod lru;
pub mod media;
pub mod origin;
pub mod pool;
pub mod range_lock;
pub mod store;
pub mod tar_frame;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use facade::{CachedFile, CachedFileSystem};
pub use pool::FileCachePool;

#[cfg(feature = "capi")]
pub mod ffi;
