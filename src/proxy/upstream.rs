use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::proxy::resolver;

/// Marker placed in the error chain when the origin cannot be reached at
/// all (resolution or connect failure). Handlers downcast to it to pick
/// between a `502 Bad Gateway` response and a silent close.
#[derive(Debug, Error)]
#[error("origin {host}:{port} unreachable")]
pub struct OriginUnreachable {
    pub host: String,
    pub port: u16,
}

impl OriginUnreachable {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

/// Resolve `host` and open a TCP connection to the first address that
/// accepts within the timeout.
pub async fn connect_to_origin(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let addrs = resolver::resolve_host(host, port, connect_timeout)
        .await
        .context(OriginUnreachable::new(host, port))?;
    connect_to_addrs(&addrs, connect_timeout)
        .await
        .context(OriginUnreachable::new(host, port))
}

/// Attempt to connect to the supplied socket addresses without performing
/// name resolution.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        let connect_future = TcpStream::connect(addr);
        match timeout(connect_timeout, connect_future).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on origin stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to origin");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                let err = Err::<(), std::io::Error>(err)
                    .with_context(|| format!("failed to connect to {}", addr))
                    .unwrap_err();
                last_err = Some(err);
            }
            Err(_) => {
                last_err = Some(anyhow::anyhow!("connection to {} timed out", addr));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no addresses provided for origin connect")))
}
