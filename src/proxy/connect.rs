use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::proxy::AppContext;
use crate::proxy::upstream;
use crate::util::timeout_with_context;

/// Relay buffer per direction.
const TUNNEL_CHUNK: usize = 8192;

pub struct TunnelStats {
    pub client_bytes: u64,
    pub origin_bytes: u64,
    pub upstream_addr: std::net::SocketAddr,
}

/// Establish and run a CONNECT tunnel: connect to the origin, confirm
/// with `200 OK`, then relay opaque bytes in both directions until either
/// side closes, an I/O error occurs, or the tunnel sits idle too long.
///
/// Origin connect failures propagate to the caller, which closes the
/// client connection without writing a response.
pub async fn handle_tunnel(
    client: &mut TcpStream,
    host: &str,
    port: u16,
    app: &AppContext,
) -> Result<TunnelStats> {
    let (mut origin, upstream_addr) =
        upstream::connect_to_origin(host, port, app.settings.upstream_connect_timeout()).await?;

    let io_timeout = app.settings.client_timeout();
    write_all_with_timeout(
        client,
        b"HTTP/1.1 200 OK\r\n\r\n",
        io_timeout,
        "confirming CONNECT tunnel",
    )
    .await?;

    let (client_bytes, origin_bytes) = relay(
        client,
        &mut origin,
        app.settings.tunnel_idle_timeout(),
        io_timeout,
    )
    .await
    .with_context(|| format!("CONNECT relay to {host}:{port} failed"))?;

    timeout_with_context(io_timeout, client.shutdown(), "closing client after CONNECT").await.ok();
    timeout_with_context(io_timeout, origin.shutdown(), "closing origin after CONNECT").await.ok();

    Ok(TunnelStats {
        client_bytes,
        origin_bytes,
        upstream_addr,
    })
}

/// Single relay loop over both directions. The idle timer is re-armed on
/// every iteration, so it measures silence across the whole tunnel, not
/// per direction. EOF on either side ends the tunnel as a whole.
async fn relay<C, O>(
    client: &mut C,
    origin: &mut O,
    idle_timeout: Duration,
    write_timeout: Duration,
) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let mut client_buf = [0u8; TUNNEL_CHUNK];
    let mut origin_buf = [0u8; TUNNEL_CHUNK];
    let mut client_bytes = 0u64;
    let mut origin_bytes = 0u64;

    loop {
        tokio::select! {
            read = client_read.read(&mut client_buf) => {
                let read = read.context("reading from CONNECT client")?;
                if read == 0 {
                    break;
                }
                write_all_with_timeout(
                    &mut origin_write,
                    &client_buf[..read],
                    write_timeout,
                    "forwarding to origin during CONNECT",
                )
                .await?;
                client_bytes = client_bytes.saturating_add(read as u64);
            }
            read = origin_read.read(&mut origin_buf) => {
                let read = read.context("reading from origin during CONNECT")?;
                if read == 0 {
                    break;
                }
                write_all_with_timeout(
                    &mut client_write,
                    &origin_buf[..read],
                    write_timeout,
                    "forwarding to CONNECT client",
                )
                .await?;
                origin_bytes = origin_bytes.saturating_add(read as u64);
            }
            _ = sleep(idle_timeout) => {
                debug!("CONNECT tunnel idle timeout");
                break;
            }
        }
    }

    Ok((client_bytes, origin_bytes))
}

#[cfg(test)]
mod tests {
    use super::relay;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn relays_bytes_both_ways_until_close() -> anyhow::Result<()> {
        let (mut client_far, mut client_near) = duplex(1024);
        let (mut origin_far, mut origin_near) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_near,
                &mut origin_near,
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await
        });

        client_far.write_all(b"ping").await?;
        let mut seen = [0u8; 4];
        origin_far.read_exact(&mut seen).await?;
        assert_eq!(&seen, b"ping");

        origin_far.write_all(b"pong-back").await?;
        let mut seen = [0u8; 9];
        client_far.read_exact(&mut seen).await?;
        assert_eq!(&seen, b"pong-back");

        // Closing the client half ends the whole tunnel.
        drop(client_far);
        let (client_bytes, origin_bytes) = relay_task.await??;
        assert_eq!(client_bytes, 4);
        assert_eq!(origin_bytes, 9);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_the_tunnel() -> anyhow::Result<()> {
        let (_client_far, mut client_near) = duplex(64);
        let (_origin_far, mut origin_near) = duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_near,
                &mut origin_near,
                Duration::from_secs(120),
                Duration::from_secs(1),
            )
            .await
        });

        tokio::time::advance(Duration::from_secs(121)).await;
        let (client_bytes, origin_bytes) = relay_task.await??;
        assert_eq!((client_bytes, origin_bytes), (0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn origin_close_ends_the_tunnel() -> anyhow::Result<()> {
        let (mut client_far, mut client_near) = duplex(64);
        let (origin_far, mut origin_near) = duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(
                &mut client_near,
                &mut origin_near,
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await
        });

        drop(origin_far);
        relay_task.await??;

        // The relay returned, so the client side is no longer serviced.
        let mut buf = [0u8; 1];
        let read = client_far.read(&mut buf).await?;
        assert_eq!(read, 0);
        Ok(())
    }
}
