use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

/// How long a closing connection keeps reading unconsumed request bytes.
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);

/// Write a minimal self-describing error/status response and report the
/// bytes written.
pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.shutdown(), "shutting down client stream").await
}

/// Send a proxy-authored response, shut the write side down, and linger
/// briefly on the read side. Unread request bytes at close time would turn
/// the FIN into an RST that can outrun the response.
///
/// Returns the bytes written, zero when the client is already gone.
pub async fn respond_and_close<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let written = send_response(stream, status, body, timeout_dur)
        .await
        .unwrap_or(0);
    shutdown_stream(stream, timeout_dur).await.ok();

    let drain = async {
        let mut scratch = [0u8; 1024];
        while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
    };
    let _ = tokio::time::timeout(LINGER_TIMEOUT, drain).await;

    written as u64
}
