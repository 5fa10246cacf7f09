use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::io_util::write_all_with_timeout;
use crate::logging::{AccessLogBuilder, Outcome};
use crate::proxy::AppContext;
use crate::proxy::codec::{RequestHead, read_request_head};
use crate::proxy::connect::handle_tunnel;
use crate::proxy::forward::forward_http;
use crate::proxy::request::{parse_absolute_target, parse_connect_target};
use crate::proxy::respond::{respond_and_close, shutdown_stream};
use crate::proxy::upstream::OriginUnreachable;

/// Drive one client connection to completion: read the request head,
/// dispatch on the method, and emit exactly one access log record for
/// anything that got far enough to be a request.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    client_id: u64,
    app: AppContext,
) -> Result<()> {
    let start = Instant::now();
    let timeout = app.settings.client_timeout();
    let mut reader = BufReader::new(stream);

    let head = match read_request_head(&mut reader, peer, timeout, app.settings.max_header_size)
        .await
    {
        Ok(Some(head)) => head,
        Ok(None) => {
            debug!(client = client_id, peer = %peer, "client closed before sending a request");
            return Ok(());
        }
        Err(err) => {
            if err.to_string().starts_with("timed out") {
                debug!(client = client_id, peer = %peer, error = %err, "client request timed out");
                return Ok(());
            }
            warn!(client = client_id, peer = %peer, error = %err, "invalid request");
            let bytes_out = respond_and_close(
                &mut reader,
                StatusCode::BAD_REQUEST,
                b"invalid request\r\n",
                timeout,
            )
            .await;
            AccessLogBuilder::new(client_id, peer)
                .method("UNKNOWN")
                .status(StatusCode::BAD_REQUEST)
                .outcome(Outcome::Error)
                .bytes(0, bytes_out)
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };

    if head.method == Method::CONNECT {
        let stream = reader.into_inner();
        return handle_connect(stream, peer, client_id, head, start, &app).await;
    }

    if head.method != Method::GET {
        warn!(
            client = client_id,
            peer = %peer,
            method = %head.method,
            "unsupported method"
        );
        let bytes_out = respond_and_close(
            &mut reader,
            StatusCode::METHOD_NOT_ALLOWED,
            b"only GET and CONNECT are supported\r\n",
            timeout,
        )
        .await;
        AccessLogBuilder::new(client_id, peer)
            .method(head.method.as_str())
            .path(head.target.clone())
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .outcome(Outcome::Error)
            .bytes(head.head_bytes as u64, bytes_out)
            .elapsed(start.elapsed())
            .log();
        return Ok(());
    }

    handle_get(reader, peer, client_id, head, start, &app).await
}

async fn handle_get(
    mut reader: BufReader<TcpStream>,
    peer: SocketAddr,
    client_id: u64,
    head: RequestHead,
    start: Instant,
    app: &AppContext,
) -> Result<()> {
    let timeout = app.settings.client_timeout();
    let url = head.target.clone();
    let bytes_in = head.head_bytes as u64;

    let target = match parse_absolute_target(&url) {
        Ok(target) => target,
        Err(err) => {
            warn!(client = client_id, peer = %peer, url, error = %err, "unparseable request target");
            let bytes_out = respond_and_close(
                &mut reader,
                StatusCode::BAD_REQUEST,
                b"invalid request target\r\n",
                timeout,
            )
            .await;
            AccessLogBuilder::new(client_id, peer)
                .method("GET")
                .path(url.clone())
                .status(StatusCode::BAD_REQUEST)
                .outcome(Outcome::Error)
                .bytes(bytes_in, bytes_out)
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };

    let log = AccessLogBuilder::new(client_id, peer)
        .method("GET")
        .host(target.host.clone())
        .path(target.path.clone());

    if let Some(body) = app.cache.get(&url) {
        debug!(client = client_id, url, bytes = body.len(), "cache hit");
        let served =
            write_all_with_timeout(&mut reader, &body, timeout, "writing cached response").await;
        shutdown_stream(&mut reader, timeout).await.ok();
        match served {
            Ok(()) => log
                .outcome(Outcome::Hit)
                .bytes(bytes_in, body.len() as u64)
                .elapsed(start.elapsed())
                .log(),
            Err(err) => {
                debug!(client = client_id, peer = %peer, error = %err, "client went away during cached response");
            }
        }
        return Ok(());
    }

    debug!(client = client_id, url, "cache miss");
    match forward_http(&mut reader, &url, &target, &head, app).await {
        Ok(stats) => {
            shutdown_stream(&mut reader, timeout).await.ok();
            debug!(
                client = client_id,
                url,
                cache_store = stats.cache_store.as_str(),
                "forwarded response"
            );
            log.outcome(Outcome::Miss)
                .bytes(bytes_in, stats.bytes_to_client)
                .elapsed(start.elapsed())
                .upstream_addr(stats.upstream_addr.to_string())
                .log();
        }
        Err(err) if err.downcast_ref::<OriginUnreachable>().is_some() => {
            warn!(client = client_id, peer = %peer, url, error = %err, "origin unreachable");
            let bytes_out = respond_and_close(
                &mut reader,
                StatusCode::BAD_GATEWAY,
                b"origin unreachable\r\n",
                timeout,
            )
            .await;
            log.status(StatusCode::BAD_GATEWAY)
                .outcome(Outcome::Error)
                .bytes(bytes_in, bytes_out)
                .elapsed(start.elapsed())
                .log();
        }
        Err(err) => {
            // Mid-exchange failure: the response may be partially written,
            // so there is nothing useful to tell the client.
            debug!(client = client_id, peer = %peer, url, error = %err, "exchange aborted");
            shutdown_stream(&mut reader, timeout).await.ok();
        }
    }
    Ok(())
}

async fn handle_connect(
    mut stream: TcpStream,
    peer: SocketAddr,
    client_id: u64,
    head: RequestHead,
    start: Instant,
    app: &AppContext,
) -> Result<()> {
    let timeout = app.settings.client_timeout();
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(client = client_id, peer = %peer, target = head.target, error = %err, "invalid CONNECT target");
            let bytes_out = respond_and_close(
                &mut stream,
                StatusCode::BAD_REQUEST,
                b"invalid CONNECT target\r\n",
                timeout,
            )
            .await;
            AccessLogBuilder::for_connect(client_id, peer, head.target.clone())
                .status(StatusCode::BAD_REQUEST)
                .outcome(Outcome::Error)
                .bytes(head.head_bytes as u64, bytes_out)
                .elapsed(start.elapsed())
                .log();
            return Ok(());
        }
    };

    debug!(client = client_id, host, port, "establishing CONNECT tunnel");
    match handle_tunnel(&mut stream, &host, port, app).await {
        Ok(stats) => {
            AccessLogBuilder::for_connect(client_id, peer, head.target.clone())
                .outcome(Outcome::Tunnel)
                .bytes(
                    head.head_bytes as u64 + stats.client_bytes,
                    stats.origin_bytes,
                )
                .elapsed(start.elapsed())
                .upstream_addr(stats.upstream_addr.to_string())
                .log();
        }
        Err(err) if err.downcast_ref::<OriginUnreachable>().is_some() => {
            // Close without a response: the client never got its 200 OK
            // and must treat the tunnel as never established.
            warn!(client = client_id, peer = %peer, host, port, error = %err, "CONNECT origin unreachable");
            shutdown_stream(&mut stream, timeout).await.ok();
            AccessLogBuilder::for_connect(client_id, peer, head.target.clone())
                .outcome(Outcome::Error)
                .bytes(head.head_bytes as u64, 0)
                .elapsed(start.elapsed())
                .log();
        }
        Err(err) => {
            debug!(client = client_id, peer = %peer, host, port, error = %err, "tunnel aborted");
            shutdown_stream(&mut stream, timeout).await.ok();
        }
    }
    Ok(())
}
