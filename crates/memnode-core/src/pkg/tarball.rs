//! Archive extraction into the virtual filesystem.
//!
//! Archives are gzip-compressed (detected by magic) or raw POSIX tar. The tar
//! stream is parsed here directly: 512-byte headers with validated checksums,
//! ustar prefixes, octal and GNU base-256 numeric fields, GNU long names and
//! pax extended headers.

use super::error::PkgError;
use crate::vfs::{path as vpath, Vfs, VfsError};
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};

const BLOCK: usize = 512;

/// Upper bound for a decompressed archive (1 GiB).
pub const MAX_UNPACKED_SIZE: u64 = 1024 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Failure while reading or materializing an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The bytes are not a readable tar stream.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// Gzip decoding failed.
    #[error("failed to decompress archive: {0}")]
    Decompress(String),

    /// An entry would land outside the destination.
    #[error("unsafe archive entry: {0}")]
    UnsafePath(String),

    #[error(transparent)]
    Fs(#[from] VfsError),
}

impl From<ArchiveError> for PkgError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::InvalidArchive(_) | ArchiveError::Decompress(_) => {
                Self::archive_invalid(e.to_string())
            }
            ArchiveError::UnsafePath(_) | ArchiveError::Fs(_) => Self::extract_failed(e.to_string()),
        }
    }
}

/// Kind of a tar entry after extended headers are folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Typeflag `'2'`: target relative to the entry's directory.
    Symlink,
    /// Typeflag `'1'`: target named from the archive root. Materialized as
    /// a symlink too.
    Link,
}

/// One entry of a parsed tar stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub link_target: Option<String>,
    pub data: Vec<u8>,
}

/// Counts of materialized entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
}

/// Strip a gzip layer if present. Raw tar is passed through.
pub fn decompress(bytes: &[u8]) -> Result<Cow<'_, [u8]>, ArchiveError> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes)
        .take(MAX_UNPACKED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| ArchiveError::Decompress(e.to_string()))?;
    if out.len() as u64 > MAX_UNPACKED_SIZE {
        return Err(ArchiveError::Decompress(format!(
            "archive expands beyond {MAX_UNPACKED_SIZE} bytes"
        )));
    }
    Ok(Cow::Owned(out))
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Numeric header field: NUL/space padded octal, or GNU base-256 when the
/// high bit of the first byte is set.
fn parse_numeric(field: &[u8]) -> Result<u64, ArchiveError> {
    if let Some((&first, rest)) = field.split_first() {
        if first & 0x80 != 0 {
            let mut value = u64::from(first & 0x7f);
            for &b in rest {
                value = value
                    .checked_mul(256)
                    .and_then(|v| v.checked_add(u64::from(b)))
                    .ok_or_else(|| ArchiveError::InvalidArchive("numeric field overflow".into()))?;
            }
            return Ok(value);
        }
    }
    let text = field_str(field);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|_| ArchiveError::InvalidArchive(format!("bad octal field '{text}'")))
}

#[allow(clippy::cast_possible_wrap)]
fn checksum_matches(header: &[u8]) -> Result<bool, ArchiveError> {
    let stored = parse_numeric(&header[148..156])?;
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in header.iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }
    Ok(stored == unsigned || u64::try_from(signed).is_ok_and(|s| s == stored))
}

/// Apply `key=value` records of a pax extended header.
fn parse_pax(data: &[u8], path: &mut Option<String>, link: &mut Option<String>) {
    let mut rest = data;
    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let Some(len) = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        else {
            break;
        };
        if len <= space + 1 || len > rest.len() {
            break;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|&b| b == b'=') {
            let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
            match &record[..eq] {
                b"path" => *path = Some(value),
                b"linkpath" => *link = Some(value),
                _ => {}
            }
        }
        rest = &rest[len..];
    }
}

/// Parse an uncompressed tar stream.
pub fn parse_tar(data: &[u8]) -> Result<Vec<TarEntry>, ArchiveError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    let mut long_name: Option<String> = None;
    let mut long_link: Option<String> = None;

    while offset + BLOCK <= data.len() {
        let header = &data[offset..offset + BLOCK];
        if header.iter().all(|&b| b == 0) {
            return Ok(entries);
        }
        if !checksum_matches(header)? {
            return Err(ArchiveError::InvalidArchive(format!(
                "header checksum mismatch at offset {offset}"
            )));
        }

        let size = usize::try_from(parse_numeric(&header[124..136])?)
            .map_err(|_| ArchiveError::InvalidArchive("entry too large".into()))?;
        let start = offset + BLOCK;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                ArchiveError::InvalidArchive(format!("truncated entry at offset {offset}"))
            })?;
        let body = &data[start..end];
        offset = start + size.div_ceil(BLOCK) * BLOCK;

        let typeflag = header[156];
        match typeflag {
            b'L' => {
                long_name = Some(field_str(body));
                continue;
            }
            b'K' => {
                long_link = Some(field_str(body));
                continue;
            }
            b'x' => {
                parse_pax(body, &mut long_name, &mut long_link);
                continue;
            }
            b'g' => continue,
            _ => {}
        }

        let path = long_name.take().unwrap_or_else(|| {
            let name = field_str(&header[0..100]);
            let prefix = if &header[257..263] == b"ustar\0" {
                field_str(&header[345..500])
            } else {
                String::new()
            };
            if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            }
        });
        let link_target = long_link.take().or_else(|| {
            let link = field_str(&header[157..257]);
            (!link.is_empty()).then_some(link)
        });
        #[allow(clippy::cast_possible_truncation)]
        let mode = (parse_numeric(&header[100..108])? & 0o7777) as u32;

        let kind = match typeflag {
            b'0' | 0 | b'7' => EntryKind::File,
            b'5' => EntryKind::Directory,
            b'2' => EntryKind::Symlink,
            b'1' => EntryKind::Link,
            other => {
                debug!(path = %path, typeflag = other, "skipping special tar entry");
                continue;
            }
        };

        entries.push(TarEntry {
            path,
            kind,
            mode,
            link_target,
            data: body.to_vec(),
        });
    }

    if offset < data.len() {
        return Err(ArchiveError::InvalidArchive(
            "trailing bytes shorter than a header block".into(),
        ));
    }
    Ok(entries)
}

/// Make an archive path relative to the destination, dropping the first
/// `strip` segments. `Ok(None)` means nothing is left after stripping.
fn archive_relative(path: &str, strip: usize) -> Result<Option<String>, ArchiveError> {
    if path.starts_with('/') {
        return Err(ArchiveError::UnsafePath(format!("absolute path: {path}")));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(ArchiveError::UnsafePath(format!("path traversal: {path}"))),
            other => parts.push(other),
        }
    }
    if parts.len() <= strip {
        return Ok(None);
    }
    Ok(Some(parts[strip..].join("/")))
}

/// Decompress and extract `bytes` below `dest`.
///
/// The first `strip_components` path segments of every entry are dropped
/// (npm tarballs use `1` for their `package/` prefix). When a `filter` is
/// given, only entries whose stripped relative path it accepts are written.
pub fn extract_to_vfs(
    vfs: &Vfs,
    bytes: &[u8],
    dest: &str,
    strip_components: usize,
    filter: Option<&dyn Fn(&str) -> bool>,
) -> Result<ExtractSummary, ArchiveError> {
    let relative = |path: &str| -> Result<Option<String>, ArchiveError> {
        Ok(archive_relative(path, strip_components)?
            .filter(|rel| filter.map_or(true, |keep| keep(rel))))
    };
    extract_with(vfs, bytes, dest, &relative)
}

/// Extract only `subdir` of an archive wrapped in one top-level directory
/// (GitHub codeload archives), re-rooting it at `dest`.
pub fn extract_subdir_to_vfs(
    vfs: &Vfs,
    bytes: &[u8],
    dest: &str,
    subdir: &str,
) -> Result<ExtractSummary, ArchiveError> {
    let prefix = format!("{}/", subdir.trim_matches('/'));
    let relative = |path: &str| -> Result<Option<String>, ArchiveError> {
        Ok(archive_relative(path, 1)?
            .and_then(|rel| rel.strip_prefix(&prefix).map(String::from))
            .filter(|rel| !rel.is_empty()))
    };
    extract_with(vfs, bytes, dest, &relative)
}

type RelativeFn<'a> = dyn Fn(&str) -> Result<Option<String>, ArchiveError> + 'a;

fn extract_with(
    vfs: &Vfs,
    bytes: &[u8],
    dest: &str,
    relative: &RelativeFn<'_>,
) -> Result<ExtractSummary, ArchiveError> {
    let tar = decompress(bytes)?;
    let entries = parse_tar(&tar)?;
    let dest = vpath::normalize(dest);
    vfs.create_dir_all(&dest)?;

    let mut summary = ExtractSummary::default();
    for entry in entries {
        let Some(rel) = relative(&entry.path)? else {
            continue;
        };
        let target = vpath::join(&dest, &rel);

        match entry.kind {
            EntryKind::Directory => {
                vfs.create_dir_all(&target)?;
                summary.directories += 1;
            }
            EntryKind::File => {
                vfs.create_dir_all(&vpath::dirname(&target))?;
                vfs.write_file(&target, &entry.data)?;
                vfs.set_mode(&target, if entry.mode == 0 { 0o644 } else { entry.mode })?;
                summary.files += 1;
            }
            EntryKind::Symlink | EntryKind::Link => {
                let Some(raw) = entry.link_target.as_deref() else {
                    continue;
                };
                let link = if entry.kind == EntryKind::Link {
                    let Some(source) = relative(raw)? else {
                        debug!(path = %entry.path, link = raw, "link target outside extracted tree; skipped");
                        continue;
                    };
                    vpath::relative(&vpath::dirname(&target), &vpath::join(&dest, &source))
                } else {
                    raw.to_string()
                };
                let resolved = vpath::join(&vpath::dirname(&target), &link);
                if link.starts_with('/')
                    || (resolved != dest && vpath::strip_ancestor(&resolved, &dest).is_none())
                {
                    warn!(path = %entry.path, link = %link, "skipping symlink that leaves the package");
                    continue;
                }
                vfs.create_dir_all(&vpath::dirname(&target))?;
                vfs.remove_all(&target)?;
                vfs.symlink(&link, &target)?;
                summary.symlinks += 1;
            }
        }
    }

    debug!(
        dest = %dest,
        files = summary.files,
        dirs = summary.directories,
        symlinks = summary.symlinks,
        "extracted archive"
    );
    Ok(summary)
}
