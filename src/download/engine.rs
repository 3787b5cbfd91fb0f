//! Download orchestrator: task registry, chunk workers and lifecycle.
//!
//! This module provides the [`DownloadOrchestrator`], which turns a URL into
//! a task, fans its chunks out to concurrent workers, aggregates their
//! progress and merges the result once every chunk is on disk.
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> Downloading -> Completed | Paused | Failed | Cancelled
//! Paused  -> Downloading (resume)
//! ```
//!
//! Completed and Cancelled tasks leave the registry. Paused and Failed tasks
//! stay registered together with their chunk temp files.
//!
//! # Concurrency Model
//!
//! - Each run owns a user [`CancellationToken`] stored in the registry, and a
//!   child token that the run itself cancels on the first fatal chunk error
//! - One Tokio task per chunk in a [`JoinSet`]; the run joins them all before
//!   deciding its outcome
//! - Workers report through an unbounded channel to a single aggregator task
//! - Registry critical sections never span an `.await`
//!
//! # Example
//!
//! ```no_run
//! use chunked_downloader::{DownloadEvent, DownloadOrchestrator, OrchestratorConfig};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = DownloadOrchestrator::new(OrchestratorConfig::default())?;
//! let mut events = orchestrator.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let DownloadEvent::Progress(p) = event {
//!             println!("{:.1}% at {:.0} B/s", p.percentage, p.speed);
//!         }
//!     }
//! });
//! let task = orchestrator
//!     .start("https://example.com/big.iso", Path::new("./big.iso"), 8)
//!     .await?;
//! println!("{} finished as {}", task.display_name, task.status);
//! # Ok(())
//! # }
//! ```

mod progress;
mod reconcile;
mod task;
mod worker;

use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use progress::{DownloadEvent, ProgressSnapshot, SpeedMeter, estimate_eta};
pub use task::{Chunk, ChunkStatus, Task, TaskId, TaskStatus, chunk_file_name};

use self::progress::{ChunkMessage, ProgressAggregator};
use self::reconcile::{reconcile_chunk, temp_file_len};
use self::worker::{ChunkJob, run_chunk};
use super::client::HttpClient;
use super::constants::EVENT_CHANNEL_CAPACITY;
use super::error::DownloadError;
use super::merge::{MergeError, cleanup_temp_files, merge_chunks};
use super::planner::plan_chunks;
use super::retry::RetryPolicy;
use crate::config::{ConfigError, OrchestratorConfig};

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Requested parallelism outside `1..=max`.
    #[error("invalid parallelism {value}: must be between 1 and {max}")]
    InvalidParallelism {
        /// The rejected value.
        value: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The metadata probe failed.
    #[error("probe failed: {0}")]
    Probe(#[source] DownloadError),

    /// The server reported a zero-byte resource.
    #[error("resource at {url} is empty")]
    EmptyResource {
        /// The probed URL.
        url: String,
    },

    /// A chunk failed after its retries were exhausted.
    #[error("chunk {index} failed: {source}")]
    Chunk {
        /// Index of the failed chunk.
        index: usize,
        /// The final fetch error.
        #[source]
        source: DownloadError,
    },

    /// Merging the chunks failed.
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    /// No registered task has this id.
    #[error("task {task_id} not found")]
    TaskNotFound {
        /// The unknown id.
        task_id: TaskId,
    },

    /// The operation is not allowed in the task's current status.
    #[error("cannot {operation} task {task_id} while it is {status}")]
    InvalidState {
        /// The task.
        task_id: TaskId,
        /// Its current status.
        status: TaskStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The task temp directory could not be prepared.
    #[error("temp storage error at {path}: {source}")]
    TempStorage {
        /// Directory that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A chunk worker panicked.
    #[error("worker for chunk {index} panicked")]
    WorkerPanicked {
        /// Index of the chunk.
        index: usize,
    },

    /// A spawned task could not be joined.
    #[error("task join failed: {0}")]
    Join(#[from] JoinError),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Cancellation handle and completion signal of the run currently driving a task.
#[derive(Debug)]
struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    /// Closed when the run has fully stopped.
    finished: watch::Receiver<()>,
}

impl RunHandle {
    /// True once the owning [`RunContext`] is gone.
    fn is_stopped(&self) -> bool {
        self.finished.has_changed().is_err()
    }
}

/// State kept by the run itself.
///
/// Dropping it detaches the run from the registry, then closes the `finished`
/// signal. A run whose future is dropped before it settled (aborted task,
/// lost `select!` branch, timeout) leaves its task Paused, so it can be
/// resumed or cancelled.
struct RunContext {
    run_id: Uuid,
    task_id: TaskId,
    cancel: CancellationToken,
    registry: Arc<DashMap<TaskId, TaskEntry>>,
    events: broadcast::Sender<DownloadEvent>,
    _finished: watch::Sender<()>,
}

impl Drop for RunContext {
    fn drop(&mut self) {
        let abandoned = {
            let Some(mut entry) = self.registry.get_mut(&self.task_id) else {
                return;
            };
            if entry
                .run
                .as_ref()
                .is_none_or(|run| run.run_id != self.run_id)
            {
                return;
            }
            entry.run = None;
            if entry.task.status == TaskStatus::Downloading {
                entry.task.status = TaskStatus::Paused;
                true
            } else {
                false
            }
        };
        if abandoned {
            warn!(task_id = %self.task_id, "run dropped before it settled, task paused");
            let _ = self.events.send(DownloadEvent::StatusChanged {
                task_id: self.task_id,
                status: TaskStatus::Paused,
            });
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    run: Option<RunHandle>,
}

/// Waits until the sender side of `finished` is dropped.
async fn wait_finished(mut finished: watch::Receiver<()>) {
    while finished.changed().await.is_ok() {}
}

/// Multi-connection downloader.
///
/// Cheap to clone; clones share the registry, HTTP client and event channel.
#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    client: HttpClient,
    config: Arc<OrchestratorConfig>,
    retry_policy: RetryPolicy,
    registry: Arc<DashMap<TaskId, TaskEntry>>,
    events: broadcast::Sender<DownloadEvent>,
}

impl DownloadOrchestrator {
    /// Creates an orchestrator from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the config is invalid and
    /// [`EngineError::Client`] if the HTTP client cannot be built.
    pub fn new(config: OrchestratorConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = HttpClient::with_config(&config).map_err(EngineError::Client)?;
        Ok(Self::with_client(config, client))
    }

    /// Creates an orchestrator around an existing client.
    ///
    /// The config is trusted as is; call [`OrchestratorConfig::validate`]
    /// first if it comes from outside.
    #[must_use]
    pub fn with_client(config: OrchestratorConfig, client: HttpClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        debug!(
            temp_root = %config.temp_root.display(),
            max_parallelism = config.max_parallelism,
            max_chunk_attempts = config.max_chunk_attempts,
            "creating download orchestrator"
        );
        Self {
            client,
            retry_policy: config.retry_policy(),
            config: Arc::new(config),
            registry: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subscribes to progress and status events of every task.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Snapshot of a registered task.
    #[must_use]
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.registry.get(&task_id).map(|entry| entry.task.clone())
    }

    /// Snapshots of every registered task, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .registry
            .iter()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Downloads `url` into `save_path` over up to `parallelism` connections.
    ///
    /// Resolves once the run stops. The returned snapshot tells how: Completed
    /// (merged, temp files removed), Paused (by [`pause`](Self::pause)) or
    /// Cancelled (by [`cancel`](Self::cancel)). Observers learn the task id
    /// early through a [`DownloadEvent::StatusChanged`] event.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidParallelism`] before any side effect
    /// - [`EngineError::Probe`] / [`EngineError::EmptyResource`] before registration
    /// - [`EngineError::TempStorage`] if the task directory cannot be created
    /// - [`EngineError::Chunk`], [`EngineError::Merge`],
    ///   [`EngineError::WorkerPanicked`] when the run fails; the task stays
    ///   registered as Failed with its temp files
    #[instrument(skip(self, save_path), fields(save_path = %save_path.display()))]
    pub async fn start(
        &self,
        url: &str,
        save_path: &Path,
        parallelism: usize,
    ) -> Result<Task, EngineError> {
        let max = self.config.max_parallelism;
        let requested = NonZeroUsize::new(parallelism)
            .filter(|value| value.get() <= max)
            .ok_or(EngineError::InvalidParallelism {
                value: parallelism,
                max,
            })?;

        let info = self.client.probe(url).await.map_err(EngineError::Probe)?;
        if info.total_size == 0 {
            return Err(EngineError::EmptyResource {
                url: url.to_string(),
            });
        }

        let effective = if info.supports_ranges {
            requested
        } else {
            NonZeroUsize::MIN
        };
        let task_id = TaskId::new();
        let temp_dir = self.config.temp_root.join(task_id.to_string());
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|source| EngineError::TempStorage {
                path: temp_dir.clone(),
                source,
            })?;

        let chunks = plan_chunks(info.total_size, effective)
            .into_iter()
            .map(|range| Chunk::new(range, &temp_dir))
            .collect();
        let now = Utc::now();
        let task = Task {
            id: task_id,
            url: url.to_string(),
            save_path: save_path.to_path_buf(),
            display_name: info.display_name,
            total_size: info.total_size,
            status: TaskStatus::Downloading,
            requested_parallelism: parallelism,
            supports_ranges: info.supports_ranges,
            temp_dir,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            chunks,
        };

        info!(
            task_id = %task_id,
            total_size = task.total_size,
            supports_ranges = task.supports_ranges,
            chunks = task.chunks.len(),
            "starting download"
        );

        let (handle, run) = self.new_run(task_id);
        self.registry.insert(
            task_id,
            TaskEntry {
                task,
                run: Some(handle),
            },
        );
        self.emit_status(task_id, TaskStatus::Downloading);

        self.execute(task_id, run).await
    }

    /// Pauses a downloading task.
    ///
    /// The status flips to Paused before the workers are signalled, and the
    /// call returns without waiting for them. Chunk temp files are kept.
    ///
    /// # Errors
    ///
    /// [`EngineError::TaskNotFound`] or [`EngineError::InvalidState`] if the
    /// task is not Downloading.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn pause(&self, task_id: TaskId) -> Result<(), EngineError> {
        {
            let mut entry = self
                .registry
                .get_mut(&task_id)
                .ok_or(EngineError::TaskNotFound { task_id })?;
            let status = entry.task.status;
            if status != TaskStatus::Downloading {
                return Err(EngineError::InvalidState {
                    task_id,
                    status,
                    operation: "pause",
                });
            }
            entry.task.status = TaskStatus::Paused;
            if let Some(run) = &entry.run {
                run.cancel.cancel();
            }
        }

        info!("download paused");
        self.emit_status(task_id, TaskStatus::Paused);
        Ok(())
    }

    /// Resumes a paused task from the bytes already in its chunk files.
    ///
    /// If the paused run is still winding down, waits for it to stop first.
    /// Resolves like [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`EngineError::TaskNotFound`] or [`EngineError::InvalidState`] (no side
    /// effects) if the task is not Paused; otherwise the run errors of
    /// [`start`](Self::start).
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn resume(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let run = loop {
            let chunks = match self.paused_chunks(task_id)? {
                PausedState::Idle(chunks) => chunks,
                PausedState::Stopping(finished) => {
                    wait_finished(finished).await;
                    continue;
                }
            };

            let mut reconciled = chunks;
            for chunk in &mut reconciled {
                reconcile_chunk(chunk, temp_file_len(&chunk.temp_path).await);
            }

            let mut entry = self
                .registry
                .get_mut(&task_id)
                .ok_or(EngineError::TaskNotFound { task_id })?;
            if entry.task.status != TaskStatus::Paused || entry.run.is_some() {
                // Raced with another resume or a cancel; re-check from scratch.
                continue;
            }
            entry.task.chunks = reconciled;
            entry.task.status = TaskStatus::Downloading;
            entry.task.started_at = Some(Utc::now());
            let (handle, run) = self.new_run(task_id);
            entry.run = Some(handle);
            info!(
                downloaded = entry.task.downloaded(),
                total = entry.task.total_size,
                "resuming download"
            );
            break run;
        };

        self.emit_status(task_id, TaskStatus::Downloading);
        self.execute(task_id, run).await
    }

    /// Cancels a task and deletes its temp files.
    ///
    /// Works on Downloading, Paused and Failed tasks. Waits for every worker
    /// of the current run to stop before deleting anything, then removes the
    /// task from the registry.
    ///
    /// # Errors
    ///
    /// [`EngineError::TaskNotFound`] if the task is not registered.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), EngineError> {
        let finished = {
            let mut entry = self
                .registry
                .get_mut(&task_id)
                .ok_or(EngineError::TaskNotFound { task_id })?;
            let status = entry.task.status;
            if status.evicts() {
                return Err(EngineError::InvalidState {
                    task_id,
                    status,
                    operation: "cancel",
                });
            }
            entry.task.status = TaskStatus::Cancelled;
            entry.run.as_ref().map(|run| {
                run.cancel.cancel();
                run.finished.clone()
            })
        };
        self.emit_status(task_id, TaskStatus::Cancelled);

        if let Some(finished) = finished {
            debug!("waiting for workers to stop");
            wait_finished(finished).await;
        }

        if let Some((_, entry)) = self.registry.remove(&task_id) {
            cleanup_temp_files(&entry.task.chunks, &entry.task.temp_dir).await;
        }
        info!("download cancelled");
        Ok(())
    }

    fn new_run(&self, task_id: TaskId) -> (RunHandle, RunContext) {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(());
        (
            RunHandle {
                run_id,
                cancel: cancel.clone(),
                finished: finished_rx,
            },
            RunContext {
                run_id,
                task_id,
                cancel,
                registry: Arc::clone(&self.registry),
                events: self.events.clone(),
                _finished: finished_tx,
            },
        )
    }

    fn paused_chunks(&self, task_id: TaskId) -> Result<PausedState, EngineError> {
        let mut entry = self
            .registry
            .get_mut(&task_id)
            .ok_or(EngineError::TaskNotFound { task_id })?;
        let status = entry.task.status;
        if status != TaskStatus::Paused {
            return Err(EngineError::InvalidState {
                task_id,
                status,
                operation: "resume",
            });
        }
        if entry.run.as_ref().is_some_and(RunHandle::is_stopped) {
            debug!("clearing handle of a stopped run");
            entry.run = None;
        }
        Ok(match &entry.run {
            Some(run) => PausedState::Stopping(run.finished.clone()),
            None => PausedState::Idle(entry.task.chunks.clone()),
        })
    }

    /// Runs the chunk workers of a registered task and settles its outcome.
    async fn execute(&self, task_id: TaskId, run: RunContext) -> Result<Task, EngineError> {
        let Some(task) = self.task(task_id) else {
            return Err(EngineError::TaskNotFound { task_id });
        };

        let abort = run.cancel.child_token();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let aggregator = ProgressAggregator::new(
            &task,
            self.config.progress_interval(),
            self.config.speed_window,
            Instant::now(),
        );
        let aggregation = tokio::spawn(self.clone().aggregate(aggregator, progress_rx));

        let url: Arc<str> = Arc::from(task.url.as_str());
        let mut workers = JoinSet::new();
        for chunk in task
            .chunks
            .iter()
            .filter(|chunk| chunk.status != ChunkStatus::Completed)
        {
            let job = ChunkJob {
                index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                temp_path: chunk.temp_path.clone(),
                url: Arc::clone(&url),
                ranged: task.supports_ranges,
            };
            let index = job.index;
            let fetch = run_chunk(
                self.client.clone(),
                job,
                self.retry_policy.clone(),
                progress_tx.clone(),
                abort.clone(),
            );
            workers.spawn(async move { (index, AssertUnwindSafe(fetch).catch_unwind().await) });
        }
        drop(progress_tx);

        let mut failure: Option<EngineError> = None;
        while let Some(joined) = workers.join_next().await {
            let error = match joined {
                Ok((_, Ok(Ok(())))) => continue,
                Ok((_, Ok(Err(error)))) if error.is_cancelled() => continue,
                Ok((index, Ok(Err(source)))) => EngineError::Chunk { index, source },
                Ok((index, Err(_panic))) => EngineError::WorkerPanicked { index },
                Err(join_error) => EngineError::Join(join_error),
            };
            if failure.is_none() {
                warn!(error = %error, "aborting run after chunk failure");
                abort.cancel();
                failure = Some(error);
            }
        }

        let all_completed = match aggregation.await {
            Ok(mut aggregator) => {
                let snapshot = aggregator.snapshot(Instant::now());
                let completed = aggregator.all_completed();
                if let Some(mut entry) = self.registry.get_mut(&task_id) {
                    aggregator.write_into(&mut entry.task);
                }
                self.emit(DownloadEvent::Progress(snapshot));
                completed
            }
            Err(error) => {
                warn!(error = %error, "progress aggregator stopped unexpectedly");
                if failure.is_none() {
                    failure = Some(EngineError::Join(error));
                }
                false
            }
        };

        if failure.is_none() && all_completed {
            return self.complete(task_id).await;
        }

        if run.cancel.is_cancelled() {
            // Pause or cancel already decided the outcome.
            let task = self.release_run(task_id, |_| {});
            debug!(status = ?task.as_ref().map(|t| t.status), "run stopped by user");
            return task.ok_or(EngineError::TaskNotFound { task_id });
        }

        let error = failure.unwrap_or(EngineError::InvalidState {
            task_id,
            status: task.status,
            operation: "complete",
        });
        self.fail(task_id, &error);
        Err(error)
    }

    /// Merges a fully downloaded task, then evicts it and removes its temp files.
    async fn complete(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let Some(task) = self.task(task_id) else {
            return Err(EngineError::TaskNotFound { task_id });
        };
        if task.status == TaskStatus::Cancelled {
            // cancel() owns the cleanup.
            self.release_run(task_id, |_| {});
            return Ok(task);
        }

        if let Err(error) = merge_chunks(&task.chunks, &task.save_path).await {
            let error = EngineError::Merge(error);
            self.fail(task_id, &error);
            return Err(error);
        }

        self.settle_merged(task_id).await
    }

    /// Marks a merged task Completed, evicting it, unless a cancel landed
    /// during the merge; then the output is discarded and cancel() cleans up.
    async fn settle_merged(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let finished = self.release_run(task_id, |task| {
            if task.status != TaskStatus::Cancelled {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
            }
        });
        let Some(task) = finished else {
            return Err(EngineError::TaskNotFound { task_id });
        };
        if task.status != TaskStatus::Completed {
            match tokio::fs::remove_file(&task.save_path).await {
                Ok(()) => debug!(path = %task.save_path.display(), "discarded output of cancelled task"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %task.save_path.display(),
                    error = %e,
                    "failed to remove output of cancelled task"
                ),
            }
            return Ok(task);
        }

        self.registry.remove(&task_id);
        cleanup_temp_files(&task.chunks, &task.temp_dir).await;
        info!(
            task_id = %task_id,
            bytes = task.total_size,
            path = %task.save_path.display(),
            "download completed"
        );
        self.emit_status(task_id, TaskStatus::Completed);
        Ok(task)
    }

    fn fail(&self, task_id: TaskId, error: &EngineError) {
        let mut marked = false;
        self.release_run(task_id, |task| {
            if task.status == TaskStatus::Downloading || task.status == TaskStatus::Paused {
                task.status = TaskStatus::Failed;
                marked = true;
            }
        });
        if marked {
            warn!(task_id = %task_id, error = %error, "download failed");
            self.emit_status(task_id, TaskStatus::Failed);
        }
    }

    /// Detaches the run handle from the task, applying `update` under the same lock.
    fn release_run(&self, task_id: TaskId, update: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut entry = self.registry.get_mut(&task_id)?;
        entry.run = None;
        update(&mut entry.task);
        Some(entry.task.clone())
    }

    /// Drains worker messages, publishing throttled snapshots.
    async fn aggregate(
        self,
        mut aggregator: ProgressAggregator,
        mut messages: mpsc::UnboundedReceiver<ChunkMessage>,
    ) -> ProgressAggregator {
        while let Some(message) = messages.recv().await {
            if let Some(event) = aggregator.apply(message) {
                self.emit(event);
            }
            if let Some(snapshot) = aggregator.poll_snapshot(Instant::now()) {
                if let Some(mut entry) = self.registry.get_mut(&snapshot.task_id) {
                    aggregator.write_into(&mut entry.task);
                }
                self.emit(DownloadEvent::Progress(snapshot));
            }
        }
        aggregator
    }

    fn emit_status(&self, task_id: TaskId, status: TaskStatus) {
        self.emit(DownloadEvent::StatusChanged { task_id, status });
    }

    fn emit(&self, event: DownloadEvent) {
        // Err only means nobody is subscribed.
        let _ = self.events.send(event);
    }
}

enum PausedState {
    Idle(Vec<Chunk>),
    Stopping(watch::Receiver<()>),
}
