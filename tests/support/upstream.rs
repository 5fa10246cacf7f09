use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum OriginBehavior {
    /// Answer every request with the fixed raw response bytes, then close.
    HttpResponse { response: Arc<Vec<u8>> },
    /// Mirror received bytes back (CONNECT payload testing).
    Echo,
}

/// Stub origin server bound to an ephemeral localhost port. Counts the
/// requests it actually serves so cache tests can prove the origin was
/// contacted exactly once.
pub struct StubOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl StubOrigin {
    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(OriginBehavior::HttpResponse {
            response: Arc::new(response.into()),
        })
        .await
    }

    pub async fn http_ok(body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        Self::http_response(response.into_bytes()).await
    }

    pub async fn echo() -> Result<Self> {
        Self::spawn(OriginBehavior::Echo).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn spawn(behavior: OriginBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let behavior = behavior.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(&mut stream, behavior, counter).await;
                });
            }
        });
        Ok(Self {
            addr,
            requests,
            handle,
        })
    }
}

impl Drop for StubOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    stream: &mut TcpStream,
    behavior: OriginBehavior,
    counter: Arc<AtomicUsize>,
) -> Result<()> {
    match behavior {
        OriginBehavior::HttpResponse { response } => {
            read_until_double_crlf(stream).await?;
            counter.fetch_add(1, Ordering::SeqCst);
            stream.write_all(&response).await?;
            stream.shutdown().await.ok();
        }
        OriginBehavior::Echo => {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
    }
    Ok(())
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(data)
}
