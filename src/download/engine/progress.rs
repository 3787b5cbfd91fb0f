//! Progress aggregation: per-chunk counters, throttling and smoothed speed.
//!
//! Chunk workers never touch shared counters. They send [`ChunkMessage`]s
//! over a channel that a single [`ProgressAggregator`] drains, so every
//! counter of a run has exactly one owner.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::task::{ChunkStatus, Task, TaskId, TaskStatus, percent};

/// Progress of one task, emitted on a throttled cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Task the snapshot belongs to.
    pub task_id: TaskId,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Resource size.
    pub total: u64,
    /// Moving-average speed in bytes per second.
    pub speed: f64,
    /// Estimated time remaining; zero while the speed is zero.
    pub eta: Duration,
    /// Completion percentage (0.0..=100.0).
    pub percentage: f64,
    /// Chunks currently being fetched.
    pub active_chunks: usize,
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// Periodic progress of a running task.
    Progress(ProgressSnapshot),
    /// The task entered a new lifecycle status.
    StatusChanged {
        /// Task whose status changed.
        task_id: TaskId,
        /// The new status.
        status: TaskStatus,
    },
    /// A chunk failed transiently and will be fetched again.
    ChunkRetrying {
        /// Task owning the chunk.
        task_id: TaskId,
        /// Chunk index.
        index: usize,
        /// Number of the upcoming attempt (the first retry is attempt 2).
        attempt: u32,
    },
}

/// Messages sent by chunk workers to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkMessage {
    /// The worker started fetching.
    Started { index: usize },
    /// Cumulative bytes of the chunk now on disk.
    Progress { index: usize, downloaded: u64 },
    /// A retry was scheduled.
    Retrying { index: usize, attempt: u32 },
    /// The worker stopped with this chunk status.
    Finished { index: usize, status: ChunkStatus },
}

/// Moving average over the last `capacity` instantaneous speed samples.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    last_sample_at: Instant,
    last_sample_bytes: u64,
    history: VecDeque<f64>,
    capacity: usize,
}

impl SpeedMeter {
    /// Starts measuring from `bytes` already downloaded at `now`.
    #[must_use]
    pub fn new(now: Instant, bytes: u64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            last_sample_at: now,
            last_sample_bytes: bytes,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a sample of `total_bytes` at `now` and returns the smoothed speed.
    pub fn record(&mut self, now: Instant, total_bytes: u64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_sample_at).as_secs_f64();
        let instant = if elapsed > 0.0 {
            total_bytes.saturating_sub(self.last_sample_bytes) as f64 / elapsed
        } else {
            0.0
        };
        self.last_sample_at = now;
        self.last_sample_bytes = total_bytes;

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(instant);
        self.smoothed()
    }

    /// Mean of the recorded samples (0.0 before the first one).
    #[must_use]
    pub fn smoothed(&self) -> f64 {
        if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        }
    }
}

/// Time left for `remaining` bytes at `speed` bytes per second.
#[must_use]
pub fn estimate_eta(remaining: u64, speed: f64) -> Duration {
    if speed > 0.0 && speed.is_finite() {
        Duration::try_from_secs_f64(remaining as f64 / speed).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkCounter {
    size: u64,
    downloaded: u64,
    status: ChunkStatus,
    retries: u32,
}

/// Owner of a run's per-chunk counters, throttle clock and speed meter.
#[derive(Debug)]
pub(crate) struct ProgressAggregator {
    task_id: TaskId,
    total: u64,
    chunks: Vec<ChunkCounter>,
    meter: SpeedMeter,
    interval: Duration,
    last_emit: Instant,
}

impl ProgressAggregator {
    pub(crate) fn new(task: &Task, interval: Duration, window: usize, now: Instant) -> Self {
        let chunks = task
            .chunks
            .iter()
            .map(|chunk| ChunkCounter {
                size: chunk.size(),
                downloaded: chunk.downloaded,
                status: chunk.status,
                retries: chunk.retry_count,
            })
            .collect();
        Self {
            task_id: task.id,
            total: task.total_size,
            chunks,
            meter: SpeedMeter::new(now, task.downloaded(), window),
            interval,
            last_emit: now,
        }
    }

    /// Applies a worker message; retries are surfaced as events right away.
    pub(crate) fn apply(&mut self, message: ChunkMessage) -> Option<DownloadEvent> {
        match message {
            ChunkMessage::Started { index } => {
                if let Some(counter) = self.chunks.get_mut(index) {
                    counter.status = ChunkStatus::Downloading;
                }
                None
            }
            ChunkMessage::Progress { index, downloaded } => {
                if let Some(counter) = self.chunks.get_mut(index) {
                    counter.downloaded = downloaded.min(counter.size);
                }
                None
            }
            ChunkMessage::Retrying { index, attempt } => {
                let counter = self.chunks.get_mut(index)?;
                counter.retries += 1;
                Some(DownloadEvent::ChunkRetrying {
                    task_id: self.task_id,
                    index,
                    attempt,
                })
            }
            ChunkMessage::Finished { index, status } => {
                if let Some(counter) = self.chunks.get_mut(index) {
                    counter.status = status;
                    if status == ChunkStatus::Completed {
                        counter.downloaded = counter.size;
                    }
                }
                None
            }
        }
    }

    pub(crate) fn downloaded(&self) -> u64 {
        self.chunks.iter().map(|counter| counter.downloaded).sum()
    }

    pub(crate) fn all_completed(&self) -> bool {
        self.chunks
            .iter()
            .all(|counter| counter.status == ChunkStatus::Completed)
    }

    /// Returns a snapshot if at least one interval passed since the last one.
    pub(crate) fn poll_snapshot(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if now.saturating_duration_since(self.last_emit) < self.interval {
            return None;
        }
        Some(self.snapshot(now))
    }

    /// Takes a speed sample and builds a snapshot unconditionally.
    pub(crate) fn snapshot(&mut self, now: Instant) -> ProgressSnapshot {
        self.last_emit = now;
        let downloaded = self.downloaded();
        let speed = self.meter.record(now, downloaded);
        let active_chunks = self
            .chunks
            .iter()
            .filter(|counter| counter.status == ChunkStatus::Downloading)
            .count();

        ProgressSnapshot {
            task_id: self.task_id,
            downloaded,
            total: self.total,
            speed,
            eta: estimate_eta(self.total.saturating_sub(downloaded), speed),
            percentage: percent(downloaded, self.total),
            active_chunks,
        }
    }

    /// Copies the counters onto the registry's projection of the task.
    pub(crate) fn write_into(&self, task: &mut Task) {
        for (chunk, counter) in task.chunks.iter_mut().zip(&self.chunks) {
            chunk.downloaded = counter.downloaded;
            chunk.status = counter.status;
            chunk.retry_count = counter.retries;
        }
    }
}
