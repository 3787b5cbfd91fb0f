//! Multi-connection HTTP download engine.
//!
//! This module splits a remote resource into byte ranges, fetches the ranges
//! concurrently into per-chunk temp files and merges them into the output.
//!
//! # Features
//!
//! - Range support detection with a HEAD probe, single-stream fallback
//! - Resumable chunk fetches (continue from the bytes already on disk)
//! - Retry with exponential backoff for transient failures
//! - Pause, resume and cancel of running tasks
//! - Throttled progress events with moving-average speed and ETA
//!
//! # Example
//!
//! ```no_run
//! use chunked_downloader::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let info = client.probe("https://example.com/big.iso").await?;
//! println!(
//!     "{}: {} bytes, ranges: {}",
//!     info.display_name, info.total_size, info.supports_ranges
//! );
//! # Ok(())
//! # }
//! ```

mod client;
pub(crate) mod constants;
mod engine;
mod error;
mod filename;
mod merge;
mod planner;
pub(crate) mod retry;

pub use client::{FetchRequest, HttpClient, ProbeInfo, default_user_agent};
pub use engine::{
    Chunk, ChunkStatus, DownloadEvent, DownloadOrchestrator, EngineError, ProgressSnapshot,
    SpeedMeter, Task, TaskId, TaskStatus, chunk_file_name, estimate_eta,
};
pub use error::DownloadError;
pub use filename::resolve_display_name;
pub use merge::{MergeError, cleanup_temp_files, merge_chunks};
pub use planner::{ChunkRange, effective_parallelism, plan_chunks};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
