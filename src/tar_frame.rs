//! Tar-frame adapter (component C): hides a fixed-size tar envelope
//! wrapping each cached blob, so the store sees logical offsets while the
//! underlying file holds physical offsets. Ported from `tar_file.cpp`.

use crate::error::{CacheError, Result};
use crate::media::MediaFile;

pub const TAR_HEADER_SIZE: u64 = 512;

const TMAGIC: &[u8; 5] = b"ustar";
const TVERSION: &[u8; 2] = b"00";
const TMAGIC_EMPTY: &[u8; 5] = b"xxtar";
const TVERSION_EMPTY: &[u8; 2] = b"xx";

/// Byte layout of a POSIX ustar header, matching `struct tar_header` in
/// `tar_file.cpp` field-for-field.
#[repr(C)]
struct RawHeader {
    name: [u8; 100],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    chksum: [u8; 8],
    typeflag: u8,
    linkname: [u8; 100],
    magic: [u8; 6],
    version: [u8; 2],
    uname: [u8; 32],
    gname: [u8; 32],
    devmajor: [u8; 8],
    devminor: [u8; 8],
    prefix: [u8; 155],
    padding: [u8; 12],
}

pub(crate) const HEADER_LEN: usize = 512;

pub(crate) fn parse_octal(field: &[u8]) -> u64 {
    let s = std::str::from_utf8(field)
        .unwrap_or("")
        .trim_matches(|c: char| c == '\0' || c.is_whitespace());
    u64::from_str_radix(s, 8).unwrap_or(0)
}

/// `width` bytes: zero-padded octal digits followed by a trailing space,
/// matching `int_to_oct` in `tar_file.cpp`.
fn format_octal(value: u64, width: usize) -> Vec<u8> {
    let mut out = format!("{:0>width$o}", value, width = width - 1).into_bytes();
    out.truncate(width - 1);
    out.push(b' ');
    out
}

fn read_header_bytes(buf: &[u8; HEADER_LEN]) -> &RawHeader {
    // SAFETY: RawHeader is a repr(C) byte-for-byte layout of exactly
    // HEADER_LEN bytes with no padding beyond the trailing `padding` field.
    unsafe { &*(buf.as_ptr() as *const RawHeader) }
}

pub(crate) fn checksum_unsigned(buf: &[u8; HEADER_LEN]) -> i64 {
    let mut sum: i64 = 0;
    for (i, &b) in buf.iter().enumerate() {
        if (148..156).contains(&i) {
            sum += b' ' as i64;
        } else {
            sum += b as i64;
        }
    }
    sum
}

pub(crate) fn checksum_signed(buf: &[u8; HEADER_LEN]) -> i64 {
    let mut sum: i64 = 0;
    for (i, &b) in buf.iter().enumerate() {
        let v = b as i8 as i64;
        if (148..156).contains(&i) {
            sum += b' ' as i64;
        } else {
            sum += v;
        }
    }
    sum
}

/// Whether the 512-byte buffer at offset 0 of a local media file looks like
/// a recognised ustar header, and if so, how many bytes of framing precede
/// the payload.
pub enum Recognition {
    /// Not a tar-framed file; treat as a raw blob.
    Raw,
    /// A materialised header/trailer is present; `header_bytes` precede the
    /// payload.
    Framed { header_bytes: u64, payload_size: u64 },
    /// The sentinel "unwritten" header: a blob opened for write whose real
    /// header has not been materialised yet.
    Unwritten,
}

/// Inspect the first header-sized chunk of a local media file and classify
/// it per `spec.md` §4.3.
pub async fn recognize(file: &dyn MediaFile) -> Result<Recognition> {
    let mut buf = [0u8; HEADER_LEN];
    let n = file.pread(&mut buf, 0).await?;
    if n < HEADER_LEN {
        return Ok(Recognition::Raw);
    }

    let raw = read_header_bytes(&buf);
    if &raw.magic[..5] == TMAGIC_EMPTY.as_slice() && &raw.version == TVERSION_EMPTY {
        return Ok(Recognition::Unwritten);
    }
    if &raw.magic[..5] != TMAGIC.as_slice() || &raw.version != TVERSION {
        return Ok(Recognition::Raw);
    }

    let stored_checksum = parse_octal(&raw.chksum) as i64;
    if stored_checksum != checksum_unsigned(&buf) && stored_checksum != checksum_signed(&buf) {
        return Err(CacheError::ChecksumMismatch);
    }

    if raw.typeflag == b'x' {
        // PAX extended header: the real header follows at offset 512, and
        // the true payload size lives in a `size=` record in between.
        let pax_size = parse_octal(&raw.size) as usize;
        let mut pax_buf = vec![0u8; pax_size.min(HEADER_LEN)];
        file.pread(&mut pax_buf, TAR_HEADER_SIZE).await?;

        let mut payload_size = 0u64;
        for line in pax_buf.split(|&b| b == b'\n') {
            if let Some(pos) = find_subslice(line, b"size=") {
                let value = &line[pos + 5..];
                if let Ok(s) = std::str::from_utf8(value) {
                    if let Ok(v) = s.trim().parse::<u64>() {
                        payload_size = v;
                        break;
                    }
                }
            }
        }

        return Ok(Recognition::Framed {
            header_bytes: 3 * TAR_HEADER_SIZE,
            payload_size,
        });
    }

    Ok(Recognition::Framed {
        header_bytes: TAR_HEADER_SIZE,
        payload_size: parse_octal(&raw.size),
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A stateless logical-to-physical offset shift for a recognised (or
/// not-yet-materialised) tar frame.
#[derive(Clone, Copy, Debug)]
pub struct TarFrame {
    pub header_bytes: u64,
}

impl TarFrame {
    pub fn raw() -> Self {
        Self { header_bytes: 0 }
    }

    pub fn physical_offset(&self, logical_offset: u64) -> u64 {
        logical_offset + self.header_bytes
    }

    /// Write the sentinel "unwritten" header used to mark a freshly created,
    /// empty blob that will be sealed with a real header on close.
    pub async fn write_sentinel(file: &dyn MediaFile) -> Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        let raw = unsafe { &mut *(buf.as_mut_ptr() as *mut RawHeader) };
        raw.name[..13].copy_from_slice(b"overlaybd.new");
        raw.version = *TVERSION_EMPTY;
        raw.magic[..5].copy_from_slice(TMAGIC_EMPTY.as_slice());
        let size_field = format_octal_nonull(u64::MAX, 12);
        raw.size.copy_from_slice(&size_field);
        file.pwrite(&buf, 0).await?;
        Ok(())
    }

    /// Synthesize a real header/trailer pair for a blob that was opened for
    /// write and was initially empty: header at offset 0, trailing
    /// zero-block(s) as an EOF marker.
    pub async fn seal(file: &dyn MediaFile, payload_size: u64) -> Result<()> {
        let mut header = [0u8; HEADER_LEN];
        let raw = unsafe { &mut *(header.as_mut_ptr() as *mut RawHeader) };
        raw.typeflag = b'0';
        raw.mode.copy_from_slice(&format_octal(0o644, 8));
        raw.size.copy_from_slice(&format_octal_nonull(payload_size, 12));
        raw.name[..17].copy_from_slice(b"overlaybd.commit");
        raw.version = *TVERSION;
        raw.magic[..5].copy_from_slice(TMAGIC.as_slice());
        let chksum_field = format_octal(checksum_unsigned(&header) as u64, 8);
        raw.chksum.copy_from_slice(&chksum_field);

        file.pwrite(&header, 0).await?;

        let trailer_start = (TAR_HEADER_SIZE + payload_size).div_ceil(TAR_HEADER_SIZE) * TAR_HEADER_SIZE;
        let zero = [0u8; HEADER_LEN];
        file.pwrite(&zero, trailer_start).await?;
        file.pwrite(&zero, trailer_start + TAR_HEADER_SIZE).await?;
        Ok(())
    }
}

/// `width` bytes: zero-padded octal digits followed by a trailing NUL,
/// matching `int_to_oct_nonull` in `tar_file.cpp`.
fn format_octal_nonull(value: u64, width: usize) -> Vec<u8> {
    let mut out = format!("{:0>width$o}", value, width = width - 1).into_bytes();
    out.truncate(width - 1);
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::MemMediaFile;

    #[tokio::test]
    async fn raw_file_is_not_framed() {
        let file = MemMediaFile::new(vec![1, 2, 3, 4]);
        let r = recognize(&file).await.unwrap();
        assert!(matches!(r, Recognition::Raw));
    }

    #[tokio::test]
    async fn sentinel_is_recognized_unwritten() {
        let file = MemMediaFile::new(vec![0u8; HEADER_LEN]);
        TarFrame::write_sentinel(&file).await.unwrap();
        let r = recognize(&file).await.unwrap();
        assert!(matches!(r, Recognition::Unwritten));
    }

    #[tokio::test]
    async fn seal_then_recognize_round_trip() {
        let file = MemMediaFile::new(vec![0u8; HEADER_LEN + 4096]);
        TarFrame::seal(&file, 4096).await.unwrap();
        let r = recognize(&file).await.unwrap();
        match r {
            Recognition::Framed {
                header_bytes,
                payload_size,
            } => {
                assert_eq!(header_bytes, TAR_HEADER_SIZE);
                assert_eq!(payload_size, 4096);
            }
            _ => panic!("expected framed recognition"),
        }
    }
}
