use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::proxy::AppContext;
use crate::proxy::codec::{HeaderLine, RequestHead};
use crate::proxy::request::HttpTarget;
use crate::proxy::upstream;
use crate::util::timeout_with_context;

/// Read size for the origin response stream.
const STREAM_CHUNK: usize = 4096;

/// What happened to the response on the cache side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStoreResult {
    /// Accumulated in full and handed to the cache.
    Stored,
    /// Nothing to store (empty response).
    Skipped,
    /// Grew past the per-entry cap; streamed through uncached.
    TooLarge,
}

impl CacheStoreResult {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStoreResult::Stored => "stored",
            CacheStoreResult::Skipped => "skipped",
            CacheStoreResult::TooLarge => "too_large",
        }
    }
}

pub struct ForwardStats {
    pub bytes_to_client: u64,
    pub cache_store: CacheStoreResult,
    pub upstream_addr: SocketAddr,
}

/// Cache-miss path: connect to the origin, send the rewritten request,
/// stream the raw response back to the client, and feed the accumulator
/// that may populate the cache once the origin closes cleanly.
pub async fn forward_http<C>(
    client: &mut C,
    url: &str,
    target: &HttpTarget,
    head: &RequestHead,
    app: &AppContext,
) -> Result<ForwardStats>
where
    C: AsyncWrite + Unpin,
{
    let (mut origin, upstream_addr) = upstream::connect_to_origin(
        &target.host,
        target.port,
        app.settings.upstream_connect_timeout(),
    )
    .await?;

    let io_timeout = app.settings.client_timeout();
    let request = build_origin_request(&head.method, target, &head.headers);
    write_all_with_timeout(
        &mut origin,
        &request,
        io_timeout,
        format!("sending request to {}:{}", target.host, target.port),
    )
    .await?;

    // The response is not framed: Connection: close upstream means the
    // origin's EOF delimits it, and the raw bytes (status line, headers,
    // body) are what a later hit replays.
    let max_entry = app.settings.max_entry_size as usize;
    let mut chunk = [0u8; STREAM_CHUNK];
    let mut accumulator: Option<Vec<u8>> = Some(Vec::new());
    let mut bytes_to_client = 0u64;

    loop {
        let read = timeout_with_context(
            io_timeout,
            origin.read(&mut chunk),
            format!("reading response from {}:{}", target.host, target.port),
        )
        .await?;
        if read == 0 {
            break;
        }

        write_all_with_timeout(
            client,
            &chunk[..read],
            io_timeout,
            "forwarding response to client",
        )
        .await?;
        bytes_to_client = bytes_to_client.saturating_add(read as u64);

        if let Some(buffer) = accumulator.as_mut() {
            if buffer.len() + read > max_entry {
                debug!(url, limit = max_entry, "response too large to cache");
                accumulator = None;
            } else {
                buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }

    timeout_with_context(io_timeout, origin.shutdown(), "closing origin stream")
        .await
        .ok();

    let cache_store = match accumulator {
        Some(buffer) if !buffer.is_empty() => {
            app.cache.put(url, Bytes::from(buffer));
            CacheStoreResult::Stored
        }
        Some(_) => CacheStoreResult::Skipped,
        None => CacheStoreResult::TooLarge,
    };

    Ok(ForwardStats {
        bytes_to_client,
        cache_store,
        upstream_addr,
    })
}

/// Rewrite the client's absolute-form request into the origin-form
/// request sent upstream: origin-form request line, a fresh `Host` and
/// `Connection: close`, then the client's remaining headers in their
/// original order.
pub fn build_origin_request(
    method: &Method,
    target: &HttpTarget,
    headers: &[HeaderLine],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, target.path).as_bytes());
    out.extend_from_slice(format!("Host: {}\r\n", target.host).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n");
    for header in headers {
        if matches!(header.lower_name(), "host" | "connection") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}
