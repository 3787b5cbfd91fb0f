//! HTTP client wrapper for probing resources and fetching byte ranges.
//!
//! This module provides the `HttpClient` struct, which answers two questions
//! for the orchestrator: what is the resource (size, range support, name),
//! and "write bytes `start..=end` of it into this file, continuing whatever is
//! already there".

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, POOL_IDLE_TIMEOUT_SECS, POOL_MAX_IDLE_PER_HOST, REQUEST_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::filename::resolve_display_name;
use crate::config::OrchestratorConfig;

/// Default User-Agent for probe and range requests (identifies the crate).
#[must_use]
pub fn default_user_agent() -> String {
    format!("chunked-downloader/{}", env!("CARGO_PKG_VERSION"))
}

/// Metadata learned from the HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Whether the server advertises `Accept-Ranges: bytes`.
    pub supports_ranges: bool,
    /// Resource size from `Content-Length`.
    pub total_size: u64,
    /// Sanitized name suggested by the server or the URL.
    pub display_name: String,
}

/// One range fetch: bytes `start..=end` of `url` into `dest`.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Source URL.
    pub url: &'a str,
    /// First byte of the range (inclusive).
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
    /// Temp file receiving the bytes; an existing prefix is continued.
    pub dest: &'a Path,
    /// `false` when the server does not support ranges: no `Range` header is
    /// sent and a partial `dest` is restarted from zero.
    pub ranged: bool,
}

impl FetchRequest<'_> {
    /// Byte width of the requested range.
    #[must_use]
    pub fn width(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// HTTP client for probes and resumable range fetches.
///
/// Built once per orchestrator and shared by every chunk worker so that
/// connections are pooled per host.
///
/// # Example
///
/// ```no_run
/// use chunked_downloader::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let info = client.probe("https://example.com/big.iso").await?;
/// println!("{} bytes, ranges: {}", info.total_size, info.supports_ranges);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default pool and timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Request timeout: 30 minutes (a single chunk can be large)
    /// - Up to 128 idle connections per host, kept for 2 minutes
    /// - No transparent decompression, so byte offsets match the entity
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = build_client(&ClientSettings::default())
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Creates a client from orchestrator settings.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend or resolver cannot be
    /// initialized.
    pub fn with_config(config: &OrchestratorConfig) -> Result<Self, reqwest::Error> {
        let settings = ClientSettings {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            user_agent: config.user_agent.clone().unwrap_or_else(default_user_agent),
        };
        Ok(Self {
            client: build_client(&settings)?,
        })
    }

    /// Learns size, range support and display name of `url` with a HEAD request.
    ///
    /// A zero size is returned as is; deciding whether it is usable is up to
    /// the caller.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The URL is invalid or not http(s)
    /// - The request fails (network error, timeout)
    /// - The server returns an error status (4xx, 5xx)
    /// - The response carries no parseable `Content-Length`
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo, DownloadError> {
        let parsed = parse_http_url(url)?;
        let response = self.send_request(Method::HEAD, url, None).await?;
        let headers = response.headers();

        let supports_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                value
                    .split(',')
                    .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
            });

        // Response::content_length() reports the (empty) HEAD body, not the header.
        let total_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| DownloadError::missing_content_length(url))?;

        let content_disposition = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok());
        let display_name = resolve_display_name(content_disposition, &parsed);

        debug!(
            supports_ranges,
            total_size,
            display_name = %display_name,
            "probe complete"
        );

        Ok(ProbeInfo {
            supports_ranges,
            total_size,
            display_name,
        })
    }

    /// Fetches `request.start..=request.end` into `request.dest`, continuing an
    /// existing prefix of the file.
    ///
    /// `on_progress` receives the cumulative number of bytes of the range held
    /// by `dest` (prefix included), first right after the prefix is measured and
    /// then after every write. Cancellation is observed between writes and
    /// while waiting on the network; a started write always completes and the
    /// file is flushed before returning.
    ///
    /// Returns the number of bytes of the range held by `dest` on success,
    /// which is always the range width.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Cancelled`] when `cancel` fired; `dest` keeps its bytes
    /// - [`DownloadError::RangeNotHonored`] when a ranged request is not
    ///   answered with `206` for the requested first byte
    /// - `Network`, `Timeout`, `HttpStatus`, `Io` for transport and disk failures
    #[instrument(
        skip(self, on_progress, cancel),
        fields(url = %request.url, start = request.start, end = request.end)
    )]
    pub async fn fetch_range<F>(
        &self,
        request: &FetchRequest<'_>,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(u64) + Send,
    {
        let width = request.width();
        let existing = existing_len(request.dest).await?;

        if existing >= width {
            debug!(existing, width, "range already on disk, skipping request");
            on_progress(width);
            return Ok(width);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let already = if request.ranged { existing } else { 0 };
        if already > 0 {
            on_progress(already);
        }
        let effective_start = request.start + already;
        let range_value = request
            .ranged
            .then(|| format!("bytes={effective_start}-{}", request.end));

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.send_request(Method::GET, request.url, range_value.as_deref()) => response?,
        };

        if request.ranged {
            verify_partial_response(&response, request.url, effective_start, request.end)?;
        }

        let file = if already > 0 {
            OpenOptions::new()
                .append(true)
                .open(request.dest)
                .await
                .map_err(|e| DownloadError::io(request.dest, e))?
        } else {
            File::create(request.dest)
                .await
                .map_err(|e| DownloadError::io(request.dest, e))?
        };

        let written = stream_to_file(
            file,
            response,
            request,
            already,
            &mut on_progress,
            cancel,
        )
        .await?;

        let held = already + written;
        if held < width {
            // Body ended early; the prefix stays for the next attempt.
            return Err(DownloadError::truncated_body(request.url, width, held));
        }

        debug!(bytes = held, resumed_from = already, "range complete");
        Ok(held)
    }

    async fn send_request(
        &self,
        method: Method,
        url: &str,
        range_header: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.request(method, url);
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        if !response.status().is_success() {
            return Err(DownloadError::http_status(url, response.status().as_u16()));
        }

        Ok(response)
    }
}

fn parse_http_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    if matches!(parsed.scheme(), "http" | "https") {
        Ok(parsed)
    } else {
        Err(DownloadError::invalid_url(url))
    }
}

async fn existing_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

/// A ranged request must come back as `206` starting at the requested byte.
fn verify_partial_response(
    response: &reqwest::Response,
    url: &str,
    start: u64,
    end: u64,
) -> Result<(), DownloadError> {
    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::range_not_honored(
            url,
            status.as_u16(),
            start,
            end,
        ));
    }

    let content_range_start = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_content_range_start);
    if let Some(first) = content_range_start
        && first != start
    {
        debug!(expected = start, got = first, "Content-Range mismatch");
        return Err(DownloadError::range_not_honored(
            url,
            status.as_u16(),
            start,
            end,
        ));
    }
    Ok(())
}

/// First byte of a `Content-Range: bytes <first>-<last>/<size>` header.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (first, _) = spec.split_once('-')?;
    first.trim().parse().ok()
}

/// Streams the response body into `file`, returning the bytes written.
///
/// Never writes more than the range still missing. The writer is flushed on
/// every exit path.
async fn stream_to_file<F>(
    file: File,
    response: reqwest::Response,
    request: &FetchRequest<'_>,
    already: u64,
    on_progress: &mut F,
    cancel: &CancellationToken,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64) + Send,
{
    let mut writer = BufWriter::new(file);
    let outcome = copy_body(&mut writer, response, request, already, on_progress, cancel).await;
    let flushed = writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(request.dest, e));

    match (outcome, flushed) {
        (Err(error), _) => Err(error),
        (Ok(_), Err(error)) => Err(error),
        (Ok(written), Ok(())) => Ok(written),
    }
}

async fn copy_body<F>(
    writer: &mut BufWriter<File>,
    response: reqwest::Response,
    request: &FetchRequest<'_>,
    already: u64,
    on_progress: &mut F,
    cancel: &CancellationToken,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64) + Send,
{
    let remaining = request.width() - already;
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while bytes_written < remaining {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                trace!(bytes_written, "cancelled while waiting for data");
                return Err(DownloadError::Cancelled);
            }
            next = stream.next() => next,
        };
        let Some(chunk_result) = next else {
            break;
        };
        let chunk = chunk_result.map_err(|e| DownloadError::from_reqwest(request.url, e))?;

        let room = usize::try_from(remaining - bytes_written).unwrap_or(usize::MAX);
        let slice = &chunk[..chunk.len().min(room)];
        writer
            .write_all(slice)
            .await
            .map_err(|e| DownloadError::io(request.dest, e))?;

        bytes_written += slice.len() as u64;
        on_progress(already + bytes_written);
    }

    Ok(bytes_written)
}

struct ClientSettings {
    connect_timeout: Duration,
    request_timeout: Duration,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
    user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            pool_max_idle_per_host: POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout: Duration::from_secs(POOL_IDLE_TIMEOUT_SECS),
            user_agent: default_user_agent(),
        }
    }
}

fn build_client(settings: &ClientSettings) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_idle_timeout(settings.pool_idle_timeout)
        .user_agent(settings.user_agent.as_str())
        .build()
}
