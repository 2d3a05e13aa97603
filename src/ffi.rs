//! C API surface. Every call blocks the calling thread on an internal Tokio
//! runtime, matching the synchronous shape C callers expect while the crate
//! itself stays async internally. Ported from the teacher's `ffi.rs`
//! (opaque handles, thread-local last-error, `pravaha_*`-style exports),
//! renamed and rewired onto [`crate::facade::CachedFileSystem`].

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use libc::size_t;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::facade::{CachedFile, CachedFileSystem};
use crate::media::LocalMediaFs;
use crate::origin::{HttpOriginFs, OriginConfig};
use crate::pool::FileCachePool;

#[repr(C)]
#[allow(non_camel_case_types)]
pub enum StrataErrorCode {
    STRATA_SUCCESS = 0,
    STRATA_INVALID_ARGUMENT = 1,
    STRATA_NOT_FOUND = 2,
    STRATA_NO_SPACE = 3,
    STRATA_ORIGIN = 4,
    STRATA_UNSUPPORTED = 5,
    STRATA_FILE_CLOSED = 6,
    STRATA_IO = 7,
    STRATA_UNKNOWN = 99,
}

impl From<&CacheError> for StrataErrorCode {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::Alignment(_) => StrataErrorCode::STRATA_INVALID_ARGUMENT,
            CacheError::NotFound(_) => StrataErrorCode::STRATA_NOT_FOUND,
            CacheError::NoSpace => StrataErrorCode::STRATA_NO_SPACE,
            CacheError::Origin(_) => StrataErrorCode::STRATA_ORIGIN,
            CacheError::Unsupported(_) => StrataErrorCode::STRATA_UNSUPPORTED,
            CacheError::FileClosed => StrataErrorCode::STRATA_FILE_CLOSED,
            CacheError::LockRetryExhausted
            | CacheError::ChecksumMismatch
            | CacheError::AlreadyExists(_)
            | CacheError::Io(_) => StrataErrorCode::STRATA_IO,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(err: &CacheError) {
    let msg = CString::new(err.to_string()).unwrap_or_else(|_| CString::new("non-UTF8 error message").unwrap());
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn set_last_error_str(msg: &str) {
    let msg = CString::new(msg).unwrap_or_else(|_| CString::new("invalid argument").unwrap());
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Opaque handle wrapping the pool-backed facade plus the runtime that
/// drives it.
pub struct StrataFilesystem {
    inner: CachedFileSystem,
    runtime: Arc<tokio::runtime::Runtime>,
}

/// Opaque handle for an open cache-backed file. Keeps a byte cursor so the
/// C API can offer the usual read/seek/tell surface over the facade's
/// offset-based `pread`.
pub struct StrataFile {
    inner: CachedFile,
    runtime: Arc<tokio::runtime::Runtime>,
    cursor: AtomicU64,
}

unsafe fn cstr_arg<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, ()> {
    if ptr.is_null() {
        set_last_error_str(&format!("{what} is null"));
        return Err(());
    }
    match unsafe { CStr::from_ptr(ptr) }.to_str() {
        Ok(s) => Ok(s),
        Err(_) => {
            set_last_error_str(&format!("{what} is not valid UTF-8"));
            Err(())
        }
    }
}

/// Get the last error message for this thread, or NULL if the previous call
/// succeeded. Valid until the next `strata_*` call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn strata_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

/// Create a cache rooted at `cache_dir` with the given capacity, fetching
/// misses over HTTP(S).
///
/// # Safety
/// `cache_dir` must be a valid null-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_create(cache_dir: *const c_char, capacity_gb: u64) -> *mut StrataFilesystem {
    clear_last_error();

    let Ok(dir) = (unsafe { cstr_arg(cache_dir, "cache_dir") }) else {
        return ptr::null_mut();
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => Arc::new(rt),
        Err(e) => {
            set_last_error(&CacheError::Io(e));
            return ptr::null_mut();
        }
    };

    let config = CacheConfig::builder()
        .registry_cache_dir(dir)
        .registry_cache_size_gb(capacity_gb.max(1))
        .build();

    let media_fs = Arc::new(LocalMediaFs::new(config.registry_cache_dir.clone()));
    let origin_fs = Arc::new(HttpOriginFs::new(OriginConfig::default()));
    let pool = Arc::new(FileCachePool::new(media_fs, origin_fs.clone(), &config));
    Arc::clone(&pool).spawn_eviction_loop(config.eviction_period);

    let inner = CachedFileSystem::new(pool, origin_fs);
    Box::into_raw(Box::new(StrataFilesystem { inner, runtime }))
}

/// Open (or create) a cache entry for `path`, refillable from `origin_url`.
/// Returns NULL on error.
///
/// # Safety
/// `fs` must be a valid handle; `path` and `origin_url` must be valid
/// null-terminated C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_open(
    fs: *mut StrataFilesystem,
    path: *const c_char,
    origin_url: *const c_char,
) -> *mut StrataFile {
    clear_last_error();

    if fs.is_null() {
        set_last_error_str("filesystem handle is null");
        return ptr::null_mut();
    }
    let fs_ref = unsafe { &*fs };

    let (Ok(path), Ok(origin_url)) = (unsafe { cstr_arg(path, "path") }, unsafe { cstr_arg(origin_url, "origin_url") })
    else {
        return ptr::null_mut();
    };

    match fs_ref.runtime.block_on(fs_ref.inner.open(path, origin_url)) {
        Ok(file) => Box::into_raw(Box::new(StrataFile {
            inner: file,
            runtime: Arc::clone(&fs_ref.runtime),
            cursor: AtomicU64::new(0),
        })),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Read up to `size` bytes at the file's current cursor, advancing it by
/// the number of bytes read. Returns the byte count, or -1 on error.
///
/// # Safety
/// `file` must be a valid handle; `buffer` must be valid for writes of at
/// least `size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_read(file: *mut StrataFile, buffer: *mut u8, size: size_t) -> isize {
    clear_last_error();

    if file.is_null() || buffer.is_null() {
        set_last_error_str("null pointer argument");
        return -1;
    }
    let file_ref = unsafe { &*file };
    let buf = unsafe { slice::from_raw_parts_mut(buffer, size) };
    let offset = file_ref.cursor.load(Ordering::Relaxed);

    match file_ref.runtime.block_on(file_ref.inner.pread(buf, offset)) {
        Ok(n) => {
            file_ref.cursor.fetch_add(n as u64, Ordering::Relaxed);
            n as isize
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Move the file's cursor to an absolute byte position.
///
/// # Safety
/// `file` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_seek(file: *mut StrataFile, pos: u64) -> c_int {
    if file.is_null() {
        set_last_error_str("null file pointer");
        return StrataErrorCode::STRATA_INVALID_ARGUMENT as c_int;
    }
    let file_ref = unsafe { &*file };
    file_ref.cursor.store(pos, Ordering::Relaxed);
    StrataErrorCode::STRATA_SUCCESS as c_int
}

/// Current cursor position.
///
/// # Safety
/// `file` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_tell(file: *const StrataFile) -> u64 {
    if file.is_null() {
        return 0;
    }
    unsafe { &*file }.cursor.load(Ordering::Relaxed)
}

/// Best-effort known size of the backing blob (the last size reported by
/// the origin or observed after a write); 0 if not yet known.
///
/// # Safety
/// `file` must be a valid handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_size(file: *const StrataFile) -> u64 {
    if file.is_null() {
        return 0;
    }
    unsafe { &*file }.inner.fstat().actual_size
}

/// Close a file handle and release its pool reference.
///
/// # Safety
/// `file` must be a valid handle or NULL, and must not be used afterward.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_file_close(file: *mut StrataFile) {
    if !file.is_null() {
        let _ = unsafe { Box::from_raw(file) };
    }
}

/// Free a filesystem handle.
///
/// # Safety
/// `fs` must be a valid handle or NULL, and must not be used afterward.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strata_filesystem_free(fs: *mut StrataFilesystem) {
    if !fs.is_null() {
        let _ = unsafe { Box::from_raw(fs) };
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn strata_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
