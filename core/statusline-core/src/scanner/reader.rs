//! Byte-offset incremental reader for append-only transcript files.
//!
//! One `stat`, then at most one positioned read of the bytes appended since
//! the last scan. The whole file is never buffered.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{Result, StatuslineError};

/// Outcome of one incremental read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    /// Bytes in `[start_offset, new_offset)`.
    pub bytes: Vec<u8>,
    /// Offset the read started from (0 after a reset).
    pub start_offset: u64,
    pub new_offset: u64,
    /// File mtime in milliseconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    /// Nothing new to read.
    pub cache_hit: bool,
    /// The file shrank below the previous offset; the caller must rescan from scratch.
    pub reset: bool,
}

/// Reads whatever was appended to `path` since `last_offset`.
///
/// A file smaller than `last_offset` (truncated or rotated) is not an error:
/// the offset is clamped to 0 and `reset` is set.
pub fn read_incremental(path: &Path, last_offset: u64, last_mtime: i64) -> Result<ReadResult> {
    let metadata = match fs_err::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StatuslineError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(StatuslineError::io("stat transcript", e)),
    };

    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    if mtime == last_mtime && size == last_offset {
        return Ok(ReadResult {
            start_offset: last_offset,
            new_offset: last_offset,
            mtime,
            size,
            cache_hit: true,
            ..Default::default()
        });
    }

    let reset = size < last_offset;
    let start = if reset { 0 } else { last_offset };

    if start >= size {
        return Ok(ReadResult {
            start_offset: start,
            new_offset: start,
            mtime,
            size,
            cache_hit: true,
            reset,
            ..Default::default()
        });
    }

    let len = size - start;
    let mut file = fs_err::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StatuslineError::NotFound(path.to_path_buf()),
        _ => StatuslineError::io("open transcript", e),
    })?;
    file.seek(SeekFrom::Start(start))
        .map_err(|e| StatuslineError::io("seek transcript", e))?;

    // The file may shrink between stat and read; take() keeps us inside the
    // range we stat'ed and a short read is simply a smaller window.
    let mut bytes = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut bytes)
        .map_err(|e| StatuslineError::io("read transcript", e))?;

    Ok(ReadResult {
        start_offset: start,
        new_offset: start + bytes.len() as u64,
        mtime,
        size,
        cache_hit: false,
        reset,
        bytes,
    })
}

/// Newlines in the first `offset` bytes of `path`, read in fixed-size chunks.
pub fn count_lines_before(path: &Path, offset: u64) -> Result<u64> {
    let file = fs_err::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StatuslineError::NotFound(path.to_path_buf()),
        _ => StatuslineError::io("open transcript", e),
    })?;
    let mut prefix = file.take(offset);
    let mut buf = [0u8; 64 * 1024];
    let mut lines = 0u64;
    loop {
        let n = prefix
            .read(&mut buf)
            .map_err(|e| StatuslineError::io("count transcript lines", e))?;
        if n == 0 {
            return Ok(lines);
        }
        lines += super::parser::count_lines(&buf[..n]);
    }
}
