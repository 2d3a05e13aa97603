//! Narrow local-media-filesystem interface: `open`/`pread`/`pwrite`/
//! `fallocate` (hole punch)/`lstat`/`unlink`/directory walk. Grounded on
//! `cache_pool.h`'s `openMedia`/`traverseDir` and `fs/fiemap.h`.

use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CacheError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaStat {
    pub size: u64,
    pub blocks_512: u64,
}

/// A single open local-media file. Implementations must be safe to share
/// across tasks (positioned reads/writes don't move a shared cursor).
#[async_trait]
pub trait MediaFile: Send + Sync {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize>;
    /// Punch a hole `[offset, offset+len)`, or to EOF when `len` is `None`.
    async fn fallocate_punch_hole(&self, offset: u64, len: Option<u64>) -> Result<()>;
    async fn fstat(&self) -> Result<MediaStat>;
    async fn set_len(&self, len: u64) -> Result<()>;
}

/// The local media filesystem: creates/opens backing files for cache
/// entries, and supports the bootstrap directory walk.
#[async_trait]
pub trait MediaFs: Send + Sync {
    async fn open_rw(&self, relative_path: &str) -> Result<Arc<dyn MediaFile>>;
    async fn lstat(&self, relative_path: &str) -> Result<MediaStat>;
    async fn unlink(&self, relative_path: &str) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    /// Walk the media root, yielding relative paths of regular files (used
    /// to warm the pool's map/LRU from files already on disk).
    async fn walk(&self) -> Result<Vec<String>>;
}

pub struct LocalMediaFile {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl MediaFile for LocalMediaFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let mut owned = vec![0u8; len];
        let (n, owned) = tokio::task::spawn_blocking(move || {
            let n = file.read_at(&mut owned, offset).unwrap_or(0);
            (n, owned)
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?;
        buf[..n].copy_from_slice(&owned[..n]);
        Ok(n)
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = Arc::clone(&self.file);
        let owned = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            file.write_at(&owned, offset).map_err(CacheError::from)
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }

    async fn fallocate_punch_hole(&self, offset: u64, len: Option<u64>) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::os::unix::io::AsRawFd;
            let fd = file.as_raw_fd();
            let length = match len {
                Some(l) => l as i64,
                None => {
                    let meta = file.metadata()?;
                    (meta.len() as i64 - offset as i64).max(0)
                }
            };
            if length == 0 {
                return Ok(());
            }
            let ret = unsafe {
                libc::fallocate(
                    fd,
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    length as libc::off_t,
                )
            };
            if ret != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOSYS) || err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                    // media filesystem doesn't support hole punching (e.g.
                    // tmpfs in some configurations); accounting still works
                    // off the in-process sparse map, so this is non-fatal.
                    return Ok(());
                }
                return Err(CacheError::Io(err));
            }
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }

    async fn fstat(&self) -> Result<MediaStat> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> Result<MediaStat> {
            let meta = file.metadata()?;
            Ok(MediaStat {
                size: meta.len(),
                blocks_512: {
                    use std::os::unix::fs::MetadataExt;
                    meta.blocks()
                },
            })
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }

    async fn set_len(&self, len: u64) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.set_len(len).map_err(CacheError::from))
            .await
            .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }
}

/// A local-disk implementation of [`MediaFs`] rooted at a directory.
/// Directories are created on demand, mirroring the original's "directories
/// are created along the path as needed" behaviour.
pub struct LocalMediaFs {
    root: PathBuf,
}

impl LocalMediaFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl MediaFs for LocalMediaFs {
    async fn open_rw(&self, relative_path: &str) -> Result<Arc<dyn MediaFile>> {
        let path = self.full_path(relative_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
            }
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))??;

        Ok(Arc::new(LocalMediaFile {
            file: Arc::new(file),
        }))
    }

    async fn lstat(&self, relative_path: &str) -> Result<MediaStat> {
        let path = self.full_path(relative_path);
        let meta = tokio::fs::symlink_metadata(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CacheError::NotFound(relative_path.to_string())
            } else {
                CacheError::Io(e)
            }
        })?;
        use std::os::unix::fs::MetadataExt;
        Ok(MediaStat {
            size: meta.len(),
            blocks_512: meta.blocks(),
        })
    }

    async fn unlink(&self, relative_path: &str) -> Result<()> {
        let path = self.full_path(relative_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from);
        let to_path = self.full_path(to);
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn walk(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut out = Vec::new();
            walk_dir(&root, &root, &mut out)?;
            Ok(out)
        })
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
    }
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &path, out)?;
        } else if file_type.is_file()
            && let Ok(rel) = path.strip_prefix(root)
        {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory [`MediaFile`] for unit tests that don't need a real disk.
    pub struct MemMediaFile {
        data: Mutex<Vec<u8>>,
        holes: Mutex<Vec<(u64, u64)>>,
    }

    impl MemMediaFile {
        pub fn new(data: Vec<u8>) -> Self {
            Self {
                data: Mutex::new(data),
                holes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaFile for MemMediaFile {
        async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let data = self.data.lock().unwrap();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
            let mut data = self.data.lock().unwrap();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        async fn fallocate_punch_hole(&self, offset: u64, len: Option<u64>) -> Result<()> {
            let data_len = self.data.lock().unwrap().len() as u64;
            let length = len.unwrap_or(data_len.saturating_sub(offset));
            self.holes.lock().unwrap().push((offset, length));
            let mut data = self.data.lock().unwrap();
            let end = (offset + length).min(data.len() as u64) as usize;
            for b in &mut data[offset as usize..end] {
                *b = 0;
            }
            Ok(())
        }

        async fn fstat(&self) -> Result<MediaStat> {
            let data = self.data.lock().unwrap();
            Ok(MediaStat {
                size: data.len() as u64,
                blocks_512: data.len().div_ceil(512) as u64,
            })
        }

        async fn set_len(&self, len: u64) -> Result<()> {
            self.data.lock().unwrap().resize(len as usize, 0);
            Ok(())
        }
    }
}
