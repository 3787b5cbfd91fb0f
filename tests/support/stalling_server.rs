//! Minimal HTTP/1.1 server whose first ranged GET stops mid-body.
//!
//! wiremock buffers whole bodies, so it cannot hold a connection open after
//! sending part of one. This server writes `stall_after` bytes of the first
//! GET, flushes them, signals `stalled` and then keeps the socket idle. Every
//! later GET is served in full, which lets a test pause while bytes are
//! genuinely in flight and resume against the same server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::range_server::parse_range_header;

const MAX_HEAD: usize = 16 * 1024;

struct Shared {
    body: Vec<u8>,
    stall_after: usize,
    armed: AtomicBool,
    ranges: Mutex<Vec<Option<String>>>,
    stalled: Arc<Notify>,
}

pub struct StallingServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_loop: JoinHandle<()>,
}

impl StallingServer {
    /// Binds to an ephemeral localhost port and starts accepting.
    pub async fn start(body: Vec<u8>, stall_after: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            body,
            stall_after,
            armed: AtomicBool::new(true),
            ranges: Mutex::new(Vec::new()),
            stalled: Arc::new(Notify::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&accept_shared)));
            }
        });

        Ok(Self {
            addr,
            shared,
            accept_loop,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Resolves once the first GET has sent its partial body.
    pub async fn wait_stalled(&self) {
        self.shared.stalled.notified().await;
    }

    /// `Range` header of every GET received so far, in arrival order.
    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.shared
            .ranges
            .lock()
            .map(|ranges| ranges.clone())
            .unwrap_or_default()
    }
}

impl Drop for StallingServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

struct RequestHead {
    method: String,
    range: Option<String>,
}

async fn read_head(stream: &mut TcpStream) -> Option<RequestHead> {
    let mut buf = Vec::new();
    let mut scratch = [0_u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            buf.truncate(end);
            break;
        }
        if buf.len() > MAX_HEAD {
            return None;
        }
        let n = stream.read(&mut scratch).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&scratch[..n]);
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let method = lines.next()?.split_whitespace().next()?.to_string();
    let range = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });
    Some(RequestHead { method, range })
}

async fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    while let Some(head) = read_head(&mut stream).await {
        let total = shared.body.len() as u64;
        let written = match head.method.as_str() {
            "HEAD" => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\n\r\n"
                );
                stream.write_all(response.as_bytes()).await
            }
            "GET" => {
                if let Ok(mut ranges) = shared.ranges.lock() {
                    ranges.push(head.range.clone());
                }
                let range = head
                    .range
                    .as_deref()
                    .and_then(parse_range_header)
                    .filter(|&(start, _)| start < total)
                    .map(|(start, end)| (start, end.unwrap_or(total - 1).min(total - 1)));
                let (status, extra, slice) = match range {
                    Some((start, end)) => (
                        "206 Partial Content",
                        format!("Content-Range: bytes {start}-{end}/{total}\r\n"),
                        &shared.body[start as usize..=end as usize],
                    ),
                    None => ("200 OK", String::new(), &shared.body[..]),
                };
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n{extra}\r\n",
                    slice.len()
                );
                if stream.write_all(header.as_bytes()).await.is_err() {
                    return;
                }

                if shared.armed.swap(false, Ordering::SeqCst) {
                    let cut = shared.stall_after.min(slice.len());
                    if stream.write_all(&slice[..cut]).await.is_err()
                        || stream.flush().await.is_err()
                    {
                        return;
                    }
                    shared.stalled.notify_one();
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return;
                }
                stream.write_all(slice).await
            }
            _ => {
                stream
                    .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
                    .await
            }
        };
        if written.is_err() || stream.flush().await.is_err() {
            return;
        }
    }
}
