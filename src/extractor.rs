//! Streaming tar-layer extractor (component G, supplemented): walks a tar
//! byte stream header-by-header and materialises each entry under a
//! destination root, applying OverlayFS whiteout conventions along the way.
//! Ported from `untar/libtar.cpp`'s `Tar::extract_all`/`extract_file` and
//! `untar/whiteout.cpp`'s `convert_whiteout`/`remove_all`.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::tar_frame;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

const TYPE_REGULAR_NUL: u8 = 0;
const TYPE_REGULAR: u8 = b'0';
const TYPE_HARDLINK: u8 = b'1';
const TYPE_SYMLINK: u8 = b'2';
const TYPE_CHR: u8 = b'3';
const TYPE_BLK: u8 = b'4';
const TYPE_DIR: u8 = b'5';
const TYPE_FIFO: u8 = b'6';
const TYPE_CONTIG: u8 = b'7';
const TYPE_GNU_LONGLINK: u8 = b'K';
const TYPE_GNU_LONGNAME: u8 = b'L';
const TYPE_PAX_HEADER: u8 = b'x';
const TYPE_PAX_GLOBAL_HEADER: u8 = b'g';

/// Tally of what an [`extract_all`] pass did, for logging at the call site.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractReport {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub whiteouts: u64,
    pub opaque_dirs: u64,
    pub skipped: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Regular,
    Dir,
    Symlink,
    Hardlink,
    Other,
}

struct EntryHeader {
    name: String,
    linkname: String,
    size: u64,
    mode: u32,
    typeflag: u8,
    kind: EntryKind,
}

enum WhiteoutAction {
    None,
    RemoveTarget(PathBuf),
    OpaqueDir(PathBuf),
}

fn parse_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Parse a single 512-byte ustar/GNU header block. Returns `None` for an
/// all-zero block (caller treats two in a row as end-of-archive).
fn parse_header(buf: &[u8; 512]) -> Result<Option<EntryHeader>> {
    if buf.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let stored_chksum = tar_frame::parse_octal(&buf[148..156]) as i64;
    if stored_chksum != tar_frame::checksum_unsigned(buf) && stored_chksum != tar_frame::checksum_signed(buf) {
        return Err(CacheError::ChecksumMismatch);
    }

    let mode = tar_frame::parse_octal(&buf[100..108]) as u32;
    let size = tar_frame::parse_octal(&buf[124..136]);
    let typeflag = buf[156];
    let magic = &buf[257..263];

    let mut name = parse_cstr(&buf[0..100]);
    if &magic[..5] == b"ustar" {
        let prefix = parse_cstr(&buf[345..500]);
        if !prefix.is_empty() {
            name = format!("{prefix}/{name}");
        }
    }
    let linkname = parse_cstr(&buf[157..257]);

    let kind = match typeflag {
        TYPE_HARDLINK => EntryKind::Hardlink,
        TYPE_SYMLINK => EntryKind::Symlink,
        TYPE_DIR => EntryKind::Dir,
        TYPE_CHR | TYPE_BLK | TYPE_FIFO => EntryKind::Other,
        TYPE_REGULAR | TYPE_REGULAR_NUL | TYPE_CONTIG if name.ends_with('/') => EntryKind::Dir,
        TYPE_REGULAR | TYPE_REGULAR_NUL | TYPE_CONTIG => EntryKind::Regular,
        _ => EntryKind::Other,
    };

    Ok(Some(EntryHeader {
        name,
        linkname,
        size,
        mode,
        typeflag,
        kind,
    }))
}

/// Records are `"<len> <key>=<value>\n"`, matching `PaxHeader::read_pax`.
fn parse_pax_records(data: &[u8]) -> ahash::HashMap<String, String> {
    use ahash::HashMapExt;
    let mut out = ahash::HashMap::new();
    let mut start = 0usize;
    while start < data.len() {
        let Some(space_pos) = data[start..].iter().position(|&b| b == b' ') else {
            break;
        };
        let Ok(len_str) = std::str::from_utf8(&data[start..start + space_pos]) else {
            break;
        };
        let Ok(len) = len_str.trim().parse::<usize>() else {
            break;
        };
        if len < 5 || start + len > data.len() {
            break;
        }
        let record = &data[start + space_pos + 1..start + len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|&b| b == b'=') {
            let key = String::from_utf8_lossy(&record[..eq]).into_owned();
            let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
            out.insert(key, value);
        }
        start += len;
    }
    out
}

/// Strip leading slashes and collapse `.`/`..` components, rejecting any
/// entry whose path would escape the destination root. Stricter than
/// `safer_name_suffix` (which only strips a leading `../` run), since here
/// every component is checked.
fn safer_relative_path(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn classify_whiteout(rel: &Path) -> WhiteoutAction {
    let Some(base) = rel.file_name().and_then(|s| s.to_str()) else {
        return WhiteoutAction::None;
    };
    let dir = rel.parent().unwrap_or_else(|| Path::new(""));
    if base == WHITEOUT_OPAQUE_DIR {
        return WhiteoutAction::OpaqueDir(dir.to_path_buf());
    }
    if let Some(target) = base.strip_prefix(WHITEOUT_PREFIX) {
        return WhiteoutAction::RemoveTarget(dir.join(target));
    }
    WhiteoutAction::None
}

/// Recursively delete `path`, tolerating a path that's already gone.
fn remove_all(path: PathBuf) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::Io(e)),
        };
        if !meta.is_dir() {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(CacheError::Io(e)),
            };
        }
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            remove_all(entry.path()).await?;
        }
        match tokio::fs::remove_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    })
}

/// All descendant paths under `dir` (files and directories, depth-first),
/// mirroring the `Walker` enumeration `convert_whiteout` uses for opaque
/// directories.
async fn walk_all(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CacheError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path.clone());
            }
            out.push(path);
        }
    }
    Ok(out)
}

async fn set_mode(path: &Path, mode: u32) {
    let perm = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = tokio::fs::set_permissions(path, perm).await {
        debug!(error = %e, path = %path.display(), "failed to set extracted entry mode");
    }
}

async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, block: &mut [u8; 512]) -> Result<bool> {
    let mut read = 0;
    while read < block.len() {
        let n = reader.read(&mut block[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(CacheError::Unsupported("truncated tar stream".into()));
        }
        read += n;
    }
    Ok(true)
}

async fn read_padded<R: AsyncRead + Unpin>(reader: &mut R, size: u64) -> Result<Vec<u8>> {
    let padded = (size as usize).div_ceil(512) * 512;
    let mut buf = vec![0u8; padded];
    reader.read_exact(&mut buf).await?;
    buf.truncate(size as usize);
    Ok(buf)
}

async fn skip_payload<R: AsyncRead + Unpin>(reader: &mut R, size: u64) -> Result<()> {
    let mut remaining = (size as usize).div_ceil(512) * 512;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        reader.read_exact(&mut buf[..chunk]).await?;
        remaining -= chunk;
    }
    Ok(())
}

async fn write_regular<R: AsyncRead + Unpin>(reader: &mut R, dest: &Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut remaining = size;
    let mut buf = [0u8; 65536];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..chunk]).await?;
        file.write_all(&buf[..chunk]).await?;
        remaining -= chunk as u64;
    }
    let pad = (size as usize).div_ceil(512) * 512 - size as usize;
    if pad > 0 {
        let mut skip = vec![0u8; pad];
        reader.read_exact(&mut skip).await?;
    }
    Ok(())
}

/// Extract a tar byte stream into `dest_root`, applying OCI whiteout
/// conventions as entries are encountered. Paths are sanitised against
/// traversal; unsupported entry types (device nodes, FIFOs) are skipped
/// with a log line rather than failing the whole layer.
pub async fn extract_all<R>(mut reader: R, dest_root: &Path) -> Result<ExtractReport>
where
    R: AsyncRead + Unpin,
{
    let mut report = ExtractReport::default();
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut pending_name: Option<String> = None;
    let mut pending_linkname: Option<String> = None;
    let mut pending_size: Option<u64> = None;
    let mut zero_blocks = 0u32;

    loop {
        let mut block = [0u8; 512];
        if !read_block(&mut reader, &mut block).await? {
            break;
        }

        let Some(mut header) = parse_header(&block)? else {
            zero_blocks += 1;
            if zero_blocks >= 2 {
                break;
            }
            continue;
        };
        zero_blocks = 0;

        match header.typeflag {
            TYPE_GNU_LONGNAME => {
                let data = read_padded(&mut reader, header.size).await?;
                pending_name = Some(parse_cstr(&data));
                continue;
            }
            TYPE_GNU_LONGLINK => {
                let data = read_padded(&mut reader, header.size).await?;
                pending_linkname = Some(parse_cstr(&data));
                continue;
            }
            TYPE_PAX_HEADER => {
                let data = read_padded(&mut reader, header.size).await?;
                let records = parse_pax_records(&data);
                if let Some(p) = records.get("path") {
                    pending_name = Some(p.clone());
                }
                if let Some(l) = records.get("linkpath") {
                    pending_linkname = Some(l.clone());
                }
                if let Some(s) = records.get("size").and_then(|s| s.trim().parse::<u64>().ok()) {
                    pending_size = Some(s);
                }
                continue;
            }
            TYPE_PAX_GLOBAL_HEADER => {
                skip_payload(&mut reader, header.size).await?;
                warn!("ignoring PAX global extended header");
                continue;
            }
            _ => {}
        }

        if let Some(n) = pending_name.take() {
            header.name = n;
        }
        if let Some(l) = pending_linkname.take() {
            header.linkname = l;
        }
        if let Some(s) = pending_size.take() {
            header.size = s;
        }

        let Some(rel) = safer_relative_path(&header.name) else {
            warn!(name = %header.name, "skipping tar entry with unsafe path");
            report.skipped += 1;
            skip_payload(&mut reader, header.size).await?;
            continue;
        };

        match classify_whiteout(&rel) {
            WhiteoutAction::OpaqueDir(dir) => {
                let dest_dir = dest_root.join(&dir);
                for path in walk_all(&dest_dir).await? {
                    if !unpacked.contains(&path) {
                        if let Err(e) = remove_all(path.clone()).await {
                            warn!(error = %e, path = %path.display(), "opaque-dir cleanup failed");
                        }
                    }
                }
                report.opaque_dirs += 1;
                skip_payload(&mut reader, header.size).await?;
                continue;
            }
            WhiteoutAction::RemoveTarget(target) => {
                let dest_target = dest_root.join(&target);
                if let Err(e) = remove_all(dest_target.clone()).await {
                    warn!(error = %e, path = %dest_target.display(), "whiteout removal failed");
                }
                report.whiteouts += 1;
                skip_payload(&mut reader, header.size).await?;
                continue;
            }
            WhiteoutAction::None => {}
        }

        let dest = dest_root.join(&rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match header.kind {
            EntryKind::Dir => {
                match tokio::fs::create_dir(&dest).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(CacheError::Io(e)),
                }
                set_mode(&dest, header.mode).await;
                report.dirs += 1;
                skip_payload(&mut reader, header.size).await?;
            }
            EntryKind::Symlink => {
                if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                    let _ = tokio::fs::remove_file(&dest).await;
                }
                tokio::fs::symlink(&header.linkname, &dest).await?;
                report.symlinks += 1;
                skip_payload(&mut reader, header.size).await?;
            }
            EntryKind::Hardlink => {
                if let Some(target_rel) = safer_relative_path(&header.linkname) {
                    let target_dest = dest_root.join(target_rel);
                    if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                        let _ = tokio::fs::remove_file(&dest).await;
                    }
                    tokio::fs::hard_link(&target_dest, &dest).await?;
                    report.hardlinks += 1;
                } else {
                    warn!(name = %header.name, "skipping hardlink with unsafe target");
                    report.skipped += 1;
                }
                skip_payload(&mut reader, header.size).await?;
            }
            EntryKind::Regular => {
                if tokio::fs::symlink_metadata(&dest).await.is_ok() {
                    let _ = tokio::fs::remove_file(&dest).await;
                }
                write_regular(&mut reader, &dest, header.size).await?;
                set_mode(&dest, header.mode).await;
                report.files += 1;
            }
            EntryKind::Other => {
                debug!(name = %header.name, typeflag = header.typeflag, "skipping unsupported tar entry type");
                report.skipped += 1;
                skip_payload(&mut reader, header.size).await?;
            }
        }

        unpacked.insert(dest);
    }

    debug!(
        files = report.files,
        dirs = report.dirs,
        symlinks = report.symlinks,
        hardlinks = report.hardlinks,
        whiteouts = report.whiteouts,
        opaque_dirs = report.opaque_dirs,
        skipped = report.skipped,
        "layer extraction complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str, typeflag: u8, linkname: &str, size: u64) -> [u8; 512] {
        let mut buf = [0u8; 512];
        let name_bytes = name.as_bytes();
        buf[..name_bytes.len().min(100)].copy_from_slice(&name_bytes[..name_bytes.len().min(100)]);
        let mode = tar_frame_format_octal(0o644, 8);
        buf[100..108].copy_from_slice(&mode);
        let size_field = tar_frame_format_octal(size, 12);
        buf[124..136].copy_from_slice(&size_field);
        buf[156] = typeflag;
        let link_bytes = linkname.as_bytes();
        buf[157..157 + link_bytes.len().min(100)].copy_from_slice(&link_bytes[..link_bytes.len().min(100)]);
        buf[257..262].copy_from_slice(b"ustar");
        buf[263] = b'0';
        buf[264] = b'0';
        // checksum over the whole block with the chksum field blanked to spaces
        for b in &mut buf[148..156] {
            *b = b' ';
        }
        let mut sum: i64 = 0;
        for &b in buf.iter() {
            sum += b as i64;
        }
        let chk = format!("{:06o}\0 ", sum);
        buf[148..148 + chk.len().min(8)].copy_from_slice(&chk.as_bytes()[..chk.len().min(8)]);
        buf
    }

    fn tar_frame_format_octal(value: u64, width: usize) -> Vec<u8> {
        let mut out = format!("{:0>width$o}", value, width = width - 1).into_bytes();
        out.truncate(width - 1);
        out.push(b' ');
        out
    }

    fn pad_to_512(mut data: Vec<u8>) -> Vec<u8> {
        let padded = data.len().div_ceil(512) * 512;
        data.resize(padded, 0);
        data
    }

    fn build_archive(entries: &[(&str, u8, &str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, typeflag, linkname, payload) in entries {
            out.extend_from_slice(&block(name, *typeflag, linkname, payload.len() as u64));
            out.extend_from_slice(&pad_to_512(payload.to_vec()));
        }
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[tokio::test]
    async fn extracts_regular_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[
            ("sub/", TYPE_DIR, "", b""),
            ("sub/hello.txt", TYPE_REGULAR, "", b"hi there"),
        ]);
        let report = extract_all(archive.as_slice(), dir.path()).await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.dirs, 1);
        let content = tokio::fs::read(dir.path().join("sub/hello.txt")).await.unwrap();
        assert_eq!(content, b"hi there");
    }

    #[tokio::test]
    async fn whiteout_removes_target_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a")).await.unwrap();
        tokio::fs::write(dir.path().join("a/gone.txt"), b"bye").await.unwrap();
        let archive = build_archive(&[("a/.wh.gone.txt", TYPE_REGULAR, "", b"")]);
        let report = extract_all(archive.as_slice(), dir.path()).await.unwrap();
        assert_eq!(report.whiteouts, 1);
        assert!(!dir.path().join("a/gone.txt").exists());
    }

    #[tokio::test]
    async fn opaque_dir_clears_preexisting_entries_not_in_this_layer() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/old")).await.unwrap();
        tokio::fs::write(dir.path().join("a/old/stale.txt"), b"stale").await.unwrap();
        let archive = build_archive(&[
            ("a/.wh..wh..opq", TYPE_REGULAR, "", b""),
            ("a/fresh.txt", TYPE_REGULAR, "", b"new"),
        ]);
        let report = extract_all(archive.as_slice(), dir.path()).await.unwrap();
        assert_eq!(report.opaque_dirs, 1);
        assert!(!dir.path().join("a/old").exists());
        assert!(dir.path().join("a/fresh.txt").exists());
    }

    #[tokio::test]
    async fn path_traversal_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("../escape.txt", TYPE_REGULAR, "", b"evil")]);
        let report = extract_all(archive.as_slice(), dir.path()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.files, 0);
    }

    #[tokio::test]
    async fn symlink_entry_is_materialised() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("link", TYPE_SYMLINK, "target", b"")]);
        extract_all(archive.as_slice(), dir.path()).await.unwrap();
        let target = tokio::fs::read_link(dir.path().join("link")).await.unwrap();
        assert_eq!(target, Path::new("target"));
    }
}
