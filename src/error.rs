use std::io;

use thiserror::Error;

/// Error taxonomy for the cache. Every fallible operation returns this
/// instead of a bare `io::Error` so callers (and the FFI layer) can tell
/// transient conditions from ones they need to report.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("offset/length not aligned to page size: {0}")]
    Alignment(String),

    #[error("range lock retry exhausted")]
    LockRetryExhausted,

    #[error("media filesystem full")]
    NoSpace,

    #[error("no such path: {0}")]
    NotFound(String),

    #[error("origin unreachable and no local copy: {0}")]
    Origin(String),

    #[error("tar header checksum mismatch")]
    ChecksumMismatch,

    #[error("advisory operation not implemented: {0}")]
    Unsupported(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("file is closed")]
    FileClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Errno-like code surfaced to FFI consumers, matching the codes named
    /// in the external-interfaces spec (EINVAL, EAGAIN, ENOSPC, ENOENT,
    /// EIO, ENOSYS, EEXIST).
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::Alignment(_) => libc::EINVAL,
            CacheError::LockRetryExhausted => libc::EAGAIN,
            CacheError::NoSpace => libc::ENOSPC,
            CacheError::NotFound(_) => libc::ENOENT,
            CacheError::Origin(_) => libc::EIO,
            CacheError::ChecksumMismatch => libc::EIO,
            CacheError::Unsupported(_) => libc::ENOSYS,
            CacheError::AlreadyExists(_) => libc::EEXIST,
            CacheError::FileClosed => libc::EBADF,
            CacheError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<&CacheError> for i32 {
    fn from(err: &CacheError) -> Self {
        err.errno()
    }
}
