use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Complete send loop with a deadline. Every write toward a client or an
/// origin goes through here so a stalled peer surfaces as a timeout error
/// instead of a hung task.
pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}
