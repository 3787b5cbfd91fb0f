//! Chunk worker: fetches one chunk, retrying transient failures.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::progress::ChunkMessage;
use super::task::ChunkStatus;
use crate::download::client::{FetchRequest, HttpClient};
use crate::download::error::DownloadError;
use crate::download::retry::{RetryDecision, RetryPolicy, classify_error};

/// Everything a worker needs to fetch one chunk.
#[derive(Debug, Clone)]
pub(crate) struct ChunkJob {
    pub(crate) index: usize,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) temp_path: PathBuf,
    pub(crate) url: Arc<str>,
    pub(crate) ranged: bool,
}

/// Fetches `job` until it completes, fails for good, or `cancel` fires.
///
/// Every attempt after the first resumes from the bytes already in the temp
/// file. The aggregator learns about every state change through `progress`;
/// send failures only mean the run is being torn down and are ignored.
#[instrument(
    skip(client, job, policy, progress, cancel),
    fields(index = job.index, start = job.start, end = job.end)
)]
pub(crate) async fn run_chunk(
    client: HttpClient,
    job: ChunkJob,
    policy: RetryPolicy,
    progress: UnboundedSender<ChunkMessage>,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    let index = job.index;
    let request = FetchRequest {
        url: &job.url,
        start: job.start,
        end: job.end,
        dest: &job.temp_path,
        ranged: job.ranged,
    };
    let finish = |status| {
        let _ = progress.send(ChunkMessage::Finished { index, status });
    };

    let _ = progress.send(ChunkMessage::Started { index });
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(attempt, "fetching chunk");

        let result = client
            .fetch_range(
                &request,
                |downloaded| {
                    let _ = progress.send(ChunkMessage::Progress { index, downloaded });
                },
                &cancel,
            )
            .await;

        let error = match result {
            Ok(bytes) => {
                debug!(bytes, "chunk complete");
                finish(ChunkStatus::Completed);
                return Ok(());
            }
            Err(error) if error.is_cancelled() => {
                debug!("chunk stopped by cancellation");
                finish(ChunkStatus::Pending);
                return Err(error);
            }
            Err(error) => error,
        };

        match policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    attempt = next_attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "retrying chunk"
                );
                let _ = progress.send(ChunkMessage::Retrying {
                    index,
                    attempt: next_attempt,
                });
                tokio::select! {
                    () = cancel.cancelled() => {
                        finish(ChunkStatus::Pending);
                        return Err(DownloadError::Cancelled);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(attempt, %reason, error = %error, "chunk failed");
                finish(ChunkStatus::Failed);
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use wiremock::matchers::method;
    use wiremock::{Mock, Request, Respond, ResponseTemplate};

    use crate::test_support::range_server::{RangeResponder, pattern};
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    /// Fails the first `failures` requests with 503, then serves ranges.
    struct FlakyRanges {
        inner: RangeResponder,
        seen: AtomicUsize,
        failures: usize,
    }

    impl Respond for FlakyRanges {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
                ResponseTemplate::new(503)
            } else {
                self.inner.respond(request)
            }
        }
    }

    fn job(url: &str, temp_path: PathBuf, end: u64) -> ChunkJob {
        ChunkJob {
            index: 0,
            start: 0,
            end,
            temp_path,
            url: Arc::from(url),
            ranged: true,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::with_max_attempts(max_attempts).with_base_delay(Duration::ZERO)
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<ChunkMessage>) -> Vec<ChunkMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_run_chunk_retries_transient_failure() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let body = pattern(256);
        Mock::given(method("GET"))
            .respond_with(FlakyRanges {
                inner: RangeResponder::new(body.clone()),
                seen: AtomicUsize::new(0),
                failures: 1,
            })
            .mount(&mock_server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("chunk_0.tmp");
        let (tx, rx) = mpsc::unbounded_channel();

        let url = format!("{}/f", mock_server.uri());
        run_chunk(
            HttpClient::new(),
            job(&url, dest.clone(), 255),
            fast_policy(3),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        let messages = drain(rx);
        assert!(messages.contains(&ChunkMessage::Retrying {
            index: 0,
            attempt: 2
        }));
        assert_eq!(
            messages.last(),
            Some(&ChunkMessage::Finished {
                index: 0,
                status: ChunkStatus::Completed
            })
        );
    }

    #[tokio::test]
    async fn test_run_chunk_gives_up_after_max_attempts() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let url = format!("{}/f", mock_server.uri());
        let result = run_chunk(
            HttpClient::new(),
            job(&url, temp_dir.path().join("chunk_0.tmp"), 99),
            fast_policy(2),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 500, .. })
        ));
        assert_eq!(
            drain(rx).last(),
            Some(&ChunkMessage::Finished {
                index: 0,
                status: ChunkStatus::Failed
            })
        );
    }

    #[tokio::test]
    async fn test_run_chunk_permanent_failure_is_not_retried() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let url = format!("{}/f", mock_server.uri());
        let result = run_chunk(
            HttpClient::new(),
            job(&url, temp_dir.path().join("chunk_0.tmp"), 99),
            fast_policy(5),
            tx,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_chunk_cancelled_reports_pending() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_chunk(
            HttpClient::new(),
            job("http://127.0.0.1:9/f", temp_dir.path().join("chunk_0.tmp"), 99),
            fast_policy(3),
            tx,
            cancel,
        )
        .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(
            drain(rx).last(),
            Some(&ChunkMessage::Finished {
                index: 0,
                status: ChunkStatus::Pending
            })
        );
    }
}
