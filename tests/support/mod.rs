#![allow(dead_code)]

mod net;
mod upstream;

pub use net::*;
pub use upstream::*;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use stashproxy::settings::Settings;

pub struct ProxyHarness {
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    /// Start the proxy on an ephemeral port with the given settings (the
    /// port field is overwritten) and wait until it accepts connections.
    pub async fn spawn_with(mut settings: Settings) -> Result<Self> {
        let port = find_free_port()?;
        settings.port = port;
        let handle = tokio::spawn(stashproxy::run(settings));
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        wait_for_listener(addr).await?;
        Ok(Self { addr, handle })
    }

    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(Settings::default()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Send one raw request and collect everything the proxy writes back
    /// until it closes the connection.
    pub async fn roundtrip(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.connect().await?;
        stream.write_all(request).await?;
        let mut response = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(10),
            stream.read_to_end(&mut response),
        )
        .await??;
        Ok(response)
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// First line of a raw HTTP response.
pub fn status_line(response: &[u8]) -> String {
    let end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    String::from_utf8_lossy(&response[..end]).to_string()
}

/// Body portion of a raw HTTP response (everything past the blank line).
pub fn body_of(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| &response[pos + 4..])
        .unwrap_or(&[])
}
