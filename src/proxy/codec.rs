use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// One header line exactly as the client sent it, with the name lowered
/// once for case-insensitive filtering.
#[derive(Clone, Debug)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower_name = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Parsed request line plus the headers in arrival order.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: Vec<HeaderLine>,
    /// Total bytes consumed for the request line and headers, terminator
    /// included.
    pub head_bytes: usize,
}

/// Read a full request head (request line and headers up to the blank
/// line) from the client.
///
/// Returns `Ok(None)` when the client closes before sending anything.
/// Exceeding `max_header_bytes` or a structurally invalid line is an
/// error; the caller answers those with `400 Bad Request`. Timeouts carry
/// a "timed out" message and are treated as a disconnect by the caller.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "header limit must be greater than zero"
    );
    let deadline = Instant::now() + timeout;

    let mut total = 0usize;
    let Some((request_line, request_line_bytes)) =
        read_head_line(reader, peer, deadline, max_header_bytes).await?
    else {
        return Ok(None);
    };
    total += request_line_bytes;
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    if !version.starts_with("HTTP/") {
        bail!("invalid HTTP version '{version}'");
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let mut headers = Vec::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(total)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request head from {peer} exceeds configured limit"))?;
        let Some((line, line_bytes)) = read_head_line(reader, peer, deadline, remaining).await?
        else {
            bail!("connection closed while reading headers from {peer}");
        };
        total += line_bytes;
        if line.is_empty() {
            break;
        }
        headers.push(parse_header_line(&line).with_context(|| format!("invalid header from {peer}"))?);
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        head_bytes: total,
    }))
}

fn parse_header_line(line: &str) -> Result<HeaderLine> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| anyhow!("header missing ':' separator"))?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() {
        bail!("header name must not be empty");
    }
    if name.contains(char::is_whitespace) {
        bail!("header name must not contain whitespace");
    }
    Ok(HeaderLine::new(name, value))
}

/// Read one CRLF-terminated line, enforcing the shared deadline and a byte
/// limit. Returns the line without its terminator alongside the raw byte
/// count, or `None` on a clean close before any byte of the line.
async fn read_head_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<(String, usize)>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut total = 0usize;
    let context = format!("reading request head from {peer}");

    loop {
        let remaining = remaining_deadline(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if total + consume > max_len {
            bail!("request head from {peer} exceeds configured limit");
        }

        line.extend_from_slice(&available[..consume]);
        reader.consume(consume);
        total += consume;

        if newline_pos.is_some() {
            break;
        }
    }

    let mut string = String::from_utf8(line)
        .map_err(|_| anyhow!("request head from {peer} contained invalid bytes"))?;
    string.pop();
    if string.ends_with('\r') {
        string.pop();
    }

    Ok(Some((string, total)))
}

fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        bail!("timed out {context}");
    }
    Ok(deadline - now)
}
