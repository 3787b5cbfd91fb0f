//! Chunked Downloader Library
//!
//! Downloads a single HTTP(S) resource over several parallel connections.
//! The resource is split into byte ranges, each range is fetched into its own
//! temp file, and the files are concatenated once every range is on disk.
//! Downloads can be paused, resumed from the bytes already fetched, and
//! cancelled.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Orchestrator settings (timeouts, pool, retry, throttling)
//! - [`download`] - Range client, chunk planner, merger and orchestrator

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig};
pub use download::{
    Chunk, ChunkStatus, DEFAULT_MAX_RETRIES, DownloadError, DownloadEvent, DownloadOrchestrator,
    EngineError, FailureType, HttpClient, MergeError, ProgressSnapshot, RetryDecision,
    RetryPolicy, Task, TaskId, TaskStatus, classify_error,
};
