//! Error types for the download module.
//!
//! This module defines structured errors for probing a resource and for
//! fetching a byte range of it, providing context-rich error messages for
//! debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while probing a resource or fetching one of its ranges.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The metadata probe did not report a usable resource size.
    #[error("server did not report a content length for {url}")]
    MissingContentLength {
        /// The probed URL.
        url: String,
    },

    /// A ranged request was answered with something other than the requested span.
    #[error("server ignored range {start}-{end} for {url} (HTTP {status})")]
    RangeNotHonored {
        /// The URL that was fetched.
        url: String,
        /// The HTTP status code of the response.
        status: u16,
        /// First requested byte.
        start: u64,
        /// Last requested byte.
        end: u64,
    },

    /// The response body ended before the whole range arrived.
    #[error("response for {url} ended early: {received} of {expected} bytes")]
    Truncated {
        /// The URL that was fetched.
        url: String,
        /// Bytes the range should hold.
        expected: u64,
        /// Bytes the range holds after the body ended.
        received: u64,
    },

    /// File system error while writing a chunk (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The fetch observed its cancellation token and stopped.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a network or timeout error depending on the reqwest error kind.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a missing content length error.
    pub fn missing_content_length(url: impl Into<String>) -> Self {
        Self::MissingContentLength { url: url.into() }
    }

    /// Creates a range-not-honored error.
    pub fn range_not_honored(url: impl Into<String>, status: u16, start: u64, end: u64) -> Self {
        Self::RangeNotHonored {
            url: url.into(),
            status,
            start,
            end,
        }
    }

    /// Creates a truncated-body error.
    pub fn truncated_body(url: impl Into<String>, expected: u64, received: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected,
            received,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true if this error is the cooperative cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs the url
// or path the source error lacks, so callers go through the helpers above.
