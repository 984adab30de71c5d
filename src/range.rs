//! HTTP byte-range parsing and chunk planning
//!
//! The upstream transfers files in fixed 1 MiB chunks addressed by chunk
//! index, while HTTP clients ask for arbitrary byte offsets. This module
//! owns the translation: validate a `Range` header against the file size,
//! then map the byte range onto a chunk offset, a head skip, and an exact
//! byte count to deliver.

use crate::error::{Error, Result};

/// The upstream protocol's fixed transfer unit. Wire constant; offsets sent
/// upstream are counted in these, never in raw bytes.
pub const CHUNK: u64 = 1_048_576;

/// A validated inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset (inclusive)
    pub start: u64,
    /// Last byte offset (inclusive)
    pub end: u64,
    /// True when no Range header was present (whole-file request)
    pub full: bool,
}

impl ByteRange {
    /// Number of bytes this range delivers.
    pub fn want(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Chunk plan for streaming this range from its first byte.
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan::at_position(self.start, self.want())
    }
}

/// Deterministic mapping of a byte position onto the upstream chunk
/// sequence. Contract consumed by the stream engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Whole chunks to skip at the upstream
    pub chunk_offset: u64,
    /// Bytes to discard from the first fetched chunk
    pub head_skip: u64,
    /// Exact number of bytes to deliver
    pub want: u64,
}

impl ChunkPlan {
    /// Plan a stream that starts at absolute byte `position` and delivers
    /// `want` bytes. Used both for the initial request and for self-heal
    /// resumes at the current byte cursor.
    pub fn at_position(position: u64, want: u64) -> Self {
        ChunkPlan {
            chunk_offset: position / CHUNK,
            head_skip: position % CHUNK,
            want,
        }
    }
}

/// Parse an optional `Range` header value against a file of `size` bytes.
///
/// Only the single-range form `bytes=S-` / `bytes=S-E` is supported.
/// Multi-range and suffix (`bytes=-N`) requests are rejected, as are
/// ranges that start at or reach past end of file. Rejections surface as
/// `RangeNotSatisfiable`, which the HTTP layer maps to 416 with
/// `Content-Range: bytes */size`.
pub fn parse_range(header: Option<&str>, size: u64) -> Result<ByteRange> {
    let Some(header) = header else {
        return Ok(ByteRange {
            start: 0,
            end: size.saturating_sub(1),
            full: true,
        });
    };

    if size == 0 {
        return Err(Error::RangeNotSatisfiable);
    }

    let spec = header
        .strip_prefix("bytes=")
        .ok_or(Error::RangeNotSatisfiable)?;

    if spec.contains(',') {
        return Err(Error::RangeNotSatisfiable);
    }

    let (start_str, end_str) = spec.split_once('-').ok_or(Error::RangeNotSatisfiable)?;
    if start_str.is_empty() {
        // suffix form bytes=-N
        return Err(Error::RangeNotSatisfiable);
    }

    let start: u64 = start_str
        .trim()
        .parse()
        .map_err(|_| Error::RangeNotSatisfiable)?;

    let end: u64 = if end_str.trim().is_empty() {
        size - 1
    } else {
        end_str
            .trim()
            .parse()
            .map_err(|_| Error::RangeNotSatisfiable)?
    };

    if start > end || end >= size {
        return Err(Error::RangeNotSatisfiable);
    }

    Ok(ByteRange {
        start,
        end,
        full: false,
    })
}
