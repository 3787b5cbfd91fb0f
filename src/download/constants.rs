//! Constants for the download module (timeouts, pooling, chunking, progress).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default overall request timeout (30 minutes, a single chunk can be large).
pub const REQUEST_TIMEOUT_SECS: u64 = 1800;

/// Default maximum idle pooled connections kept per host.
pub const POOL_MAX_IDLE_PER_HOST: usize = 128;

/// Default lifetime of an idle pooled connection (2 minutes).
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 120;

/// Smallest chunk the planner will create (1 MiB).
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Upper bound accepted for requested parallelism.
pub const MAX_PARALLELISM: usize = 128;

/// Minimum delay between two progress emissions for the same task.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Number of instantaneous speed samples averaged into the smoothed speed.
pub const SPEED_HISTORY_SIZE: usize = 10;

/// Capacity of the broadcast channel carrying download events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Name of the directory created under the system temp dir for chunk files.
pub const TEMP_DIR_NAME: &str = "chunked-downloader";
