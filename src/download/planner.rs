//! Chunk planning: split a resource into contiguous byte ranges.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::MIN_CHUNK_SIZE;

/// An inclusive byte range `[start, end]` of the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Position of the range in the plan (0-based, dense).
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
}

impl ChunkRange {
    /// Number of bytes covered by the range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Number of chunks actually used for a resource of `total_size` bytes.
///
/// Every chunk gets at least [`MIN_CHUNK_SIZE`] bytes, so small resources
/// collapse to fewer chunks than requested (never fewer than one).
#[must_use]
pub fn effective_parallelism(total_size: u64, requested: NonZeroUsize) -> usize {
    let max_possible = usize::try_from(total_size / MIN_CHUNK_SIZE).unwrap_or(usize::MAX);
    requested.get().min(max_possible.max(1))
}

/// Splits `[0, total_size - 1]` into ordered, non-overlapping ranges.
///
/// All chunks share the same base size except the last one, which absorbs
/// the integer-division remainder. A zero `total_size` yields an empty plan.
#[must_use]
pub fn plan_chunks(total_size: u64, requested: NonZeroUsize) -> Vec<ChunkRange> {
    if total_size == 0 {
        return Vec::new();
    }

    let count = effective_parallelism(total_size, requested);
    let base = total_size / count as u64;

    let chunks: Vec<ChunkRange> = (0..count)
        .map(|index| {
            let start = index as u64 * base;
            let end = if index == count - 1 {
                total_size - 1
            } else {
                start + base - 1
            };
            ChunkRange { index, start, end }
        })
        .collect();

    debug!(
        total_size,
        requested = requested.get(),
        effective = count,
        base_chunk_size = base,
        "planned chunks"
    );

    chunks
}
