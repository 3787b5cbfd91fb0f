//! Task and chunk data model owned by the orchestrator.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::download::planner::ChunkRange;

/// Opaque identity of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no chunk has started yet.
    Pending,
    /// Chunk workers are running.
    Downloading,
    /// Stopped by `pause`; temp files are kept for `resume`.
    Paused,
    /// Output file merged, temp files removed.
    Completed,
    /// A chunk or the merge failed; temp files are kept.
    Failed,
    /// Stopped by `cancel`; temp files removed.
    Cancelled,
}

impl TaskStatus {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and Cancelled tasks leave the registry.
    #[must_use]
    pub fn evicts(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not started, or stopped before finishing (its temp file may hold a prefix).
    Pending,
    /// A worker is fetching it.
    Downloading,
    /// Every byte of the range is in the temp file.
    Completed,
    /// Gave up after the retry policy was exhausted.
    Failed,
}

/// A contiguous byte range of the resource and the temp file that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the task (0-based, dense).
    pub index: usize,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (inclusive).
    pub end: u64,
    /// Bytes of this range already written to `temp_path`.
    pub downloaded: u64,
    /// Current status.
    pub status: ChunkStatus,
    /// Number of retries spent on this chunk across runs.
    pub retry_count: u32,
    /// Temp file holding the bytes of this range.
    pub temp_path: PathBuf,
}

impl Chunk {
    /// Creates a pending chunk for `range`, stored as `chunk_<index>.tmp` in `temp_dir`.
    #[must_use]
    pub fn new(range: ChunkRange, temp_dir: &Path) -> Self {
        Self {
            index: range.index,
            start: range.start,
            end: range.end,
            downloaded: 0,
            status: ChunkStatus::Pending,
            retry_count: 0,
            temp_path: temp_dir.join(chunk_file_name(range.index)),
        }
    }

    /// Byte width of the range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Deterministic temp file name of a chunk.
#[must_use]
pub fn chunk_file_name(index: usize) -> String {
    format!("chunk_{index}.tmp")
}

/// One end-to-end download operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identity.
    pub id: TaskId,
    /// Source URL.
    pub url: String,
    /// Destination of the merged file.
    pub save_path: PathBuf,
    /// Name suggested by the server or the URL.
    pub display_name: String,
    /// Resource size in bytes.
    pub total_size: u64,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Parallelism asked for by the caller.
    pub requested_parallelism: usize,
    /// Whether the server honours byte ranges.
    pub supports_ranges: bool,
    /// Directory holding the chunk temp files.
    pub temp_dir: PathBuf,
    /// When the task was registered.
    pub created_at: DateTime<Utc>,
    /// When the most recent run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the merged file was produced.
    pub completed_at: Option<DateTime<Utc>>,
    /// Chunks in index order.
    pub chunks: Vec<Chunk>,
}

impl Task {
    /// Bytes downloaded so far, summed over the chunks.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.downloaded).sum()
    }

    /// Percentage of the resource downloaded (0.0 when the size is unknown).
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        percent(self.downloaded(), self.total_size)
    }

    /// Number of chunks currently being fetched.
    #[must_use]
    pub fn active_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Downloading)
            .count()
    }

    /// Number of chunks the plan produced.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        self.chunks.len()
    }
}

pub(crate) fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}
