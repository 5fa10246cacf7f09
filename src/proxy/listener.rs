use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AppContext, handler};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen_addr();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    info!(
        address = %local_addr,
        max_connections = app.settings.max_connections,
        "proxy listener started"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        // Admission: take a permit before accepting, so the backlog is the
        // only queue once the proxy is saturated.
        let permit = tokio::select! {
            permit = app.limiter.clone().acquire_owned() => {
                permit.context("admission semaphore closed")?
            }
            _ = &mut shutdown => break,
        };

        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    drop(permit);
                    continue;
                }
            },
            _ = &mut shutdown => {
                drop(permit);
                break;
            }
        };

        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(client = client_id, peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(client = client_id, peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }

        let connection_app = app.clone();
        tokio::spawn(async move {
            // The permit travels with the task and is returned on every
            // exit path, panics included.
            let _permit = permit;
            if let Err(err) =
                handler::handle_connection(stream, peer_addr, client_id, connection_app).await
            {
                debug!(client = client_id, peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }

    // Stop accepting, then wait for every in-flight handler to give its
    // permit back before exiting.
    drop(listener);
    info!("shutdown requested, draining active connections");
    let _drained = app
        .limiter
        .acquire_many(app.settings.max_connections as u32)
        .await
        .context("admission semaphore closed during drain")?;
    info!("all connections finished");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
