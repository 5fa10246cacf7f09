use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::net::lookup_host;

use crate::util::timeout_with_context;

/// Resolve `host:port` to a deduplicated list of socket addresses.
/// Literal IP addresses bypass the resolver entirely.
pub async fn resolve_host(host: &str, port: u16, timeout_dur: Duration) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let lookup = lookup_host((host, port));
    let addrs = timeout_with_context(
        timeout_dur,
        lookup,
        format!("resolving DNS for {host}:{port}"),
    )
    .await?;

    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for addr in addrs {
        if seen.insert(addr) {
            unique.push(addr);
        }
    }
    if unique.is_empty() {
        bail!("DNS lookup for {host}:{port} returned no addresses");
    }
    Ok(unique)
}
