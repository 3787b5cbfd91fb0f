//! Ordered concatenation of chunk temp files into the final output.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::engine::Chunk;

/// Errors that abort a merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A chunk's temp file is gone.
    #[error("chunk {index} is missing its temp file {path}")]
    MissingChunk {
        /// Index of the chunk.
        index: usize,
        /// Expected temp file.
        path: PathBuf,
    },

    /// A chunk's temp file holds fewer bytes than its range.
    #[error("chunk {index} is incomplete: {actual} of {expected} bytes in {path}")]
    Incomplete {
        /// Index of the chunk.
        index: usize,
        /// Temp file that was read.
        path: PathBuf,
        /// Width of the chunk's range.
        expected: u64,
        /// Bytes actually found.
        actual: u64,
    },

    /// Reading a chunk or writing the output failed.
    #[error("IO error merging into {path}: {source}")]
    Io {
        /// File the failing operation touched.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl MergeError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Writes every chunk's bytes into `output` in index order.
///
/// The output is created (or truncated) together with its parent directories.
/// Exactly `chunk.size()` bytes are taken from each temp file. The first
/// missing or short chunk aborts the merge and the partial output is removed;
/// the temp files are left untouched.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// [`MergeError::MissingChunk`], [`MergeError::Incomplete`] or
/// [`MergeError::Io`].
#[instrument(skip(chunks), fields(chunks = chunks.len(), output = %output.display()))]
pub async fn merge_chunks(chunks: &[Chunk], output: &Path) -> Result<u64, MergeError> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.index);

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MergeError::io(parent, e))?;
    }

    let result = write_ordered(&ordered, output).await;
    if result.is_err() {
        match tokio::fs::remove_file(output).await {
            Ok(()) => debug!("partial output removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to remove partial output"),
        }
    }
    result
}

async fn write_ordered(ordered: &[&Chunk], output: &Path) -> Result<u64, MergeError> {
    let file = File::create(output)
        .await
        .map_err(|e| MergeError::io(output, e))?;
    let mut writer = BufWriter::new(file);
    let mut total: u64 = 0;

    for &chunk in ordered {
        let source = match File::open(&chunk.temp_path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MergeError::MissingChunk {
                    index: chunk.index,
                    path: chunk.temp_path.clone(),
                });
            }
            Err(e) => return Err(MergeError::io(&chunk.temp_path, e)),
        };

        let expected = chunk.size();
        let mut limited = source.take(expected);
        let copied = tokio::io::copy(&mut limited, &mut writer)
            .await
            .map_err(|e| MergeError::io(&chunk.temp_path, e))?;
        if copied < expected {
            return Err(MergeError::Incomplete {
                index: chunk.index,
                path: chunk.temp_path.clone(),
                expected,
                actual: copied,
            });
        }

        debug!(index = chunk.index, bytes = copied, "chunk merged");
        total += copied;
    }

    writer.flush().await.map_err(|e| MergeError::io(output, e))?;
    info!(bytes = total, "merge complete");
    Ok(total)
}

/// Best-effort removal of chunk temp files and the task's temp directory.
///
/// Failures are logged and otherwise ignored.
pub async fn cleanup_temp_files(chunks: &[Chunk], temp_dir: &Path) {
    for chunk in chunks {
        match tokio::fs::remove_file(&chunk.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %chunk.temp_path.display(),
                error = %e,
                "failed to remove chunk temp file"
            ),
        }
    }

    match tokio::fs::remove_dir_all(temp_dir).await {
        Ok(()) => debug!(path = %temp_dir.display(), "temp dir removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %temp_dir.display(),
            error = %e,
            "failed to remove temp dir"
        ),
    }
}
