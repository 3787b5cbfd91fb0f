//! A wiremock responder that serves a fixed body and honours `Range` headers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-per-KiB byte pattern.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Parses `bytes=<start>-<end>`; an open end is returned as `None`.
#[must_use]
pub fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Serves `body` for GET, answering ranged requests with 206 when `honor_ranges`.
#[derive(Clone)]
pub struct RangeResponder {
    pub body: Arc<Vec<u8>>,
    pub honor_ranges: bool,
    pub requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            honor_ranges: true,
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn ignoring_ranges(mut self) -> Self {
        self.honor_ranges = false;
        self
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let total = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range_header);

        match range {
            Some((start, end)) if self.honor_ranges && start < total => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                let slice = self.body[start as usize..=end as usize].to_vec();
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
                    .set_body_bytes(slice)
            }
            Some(_) if self.honor_ranges => ResponseTemplate::new(416),
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.as_ref().clone()),
        }
    }
}

/// Mounts HEAD and GET handlers for `route` serving `body`.
pub async fn mount_file(server: &MockServer, route: &str, responder: RangeResponder) {
    let mut head = ResponseTemplate::new(200).set_body_bytes(responder.body.as_ref().clone());
    if responder.honor_ranges {
        head = head.insert_header("Accept-Ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(head)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-99"), Some((0, Some(99))));
        assert_eq!(parse_range_header("bytes=100-"), Some((100, None)));
        assert_eq!(parse_range_header("items=0-1"), None);
    }
}
