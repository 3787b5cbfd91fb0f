//! Resume reconciliation: the chunk temp files are the source of truth.

use std::path::Path;

use super::task::{Chunk, ChunkStatus};

/// Aligns a chunk's status and byte count with its temp file.
///
/// `on_disk` is the temp file length, `None` when the file does not exist.
/// A file holding at least the chunk width marks it Completed; anything
/// shorter (or missing) leaves it Pending with the bytes found.
pub(crate) fn reconcile_chunk(chunk: &mut Chunk, on_disk: Option<u64>) {
    match on_disk {
        Some(len) if len >= chunk.size() => {
            chunk.downloaded = chunk.size();
            chunk.status = ChunkStatus::Completed;
        }
        Some(len) => {
            chunk.downloaded = len;
            chunk.status = ChunkStatus::Pending;
        }
        None => {
            chunk.downloaded = 0;
            chunk.status = ChunkStatus::Pending;
        }
    }
}

/// Length of a chunk temp file, `None` if it is missing or unreadable.
pub(crate) async fn temp_file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|meta| meta.len())
}
