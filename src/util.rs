use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

#[cfg(test)]
mod tests {
    use super::timeout_with_context;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reports_elapsed_deadline_with_context() {
        let handle = tokio::spawn(async {
            timeout_with_context(
                Duration::from_secs(1),
                std::future::pending::<Result<(), std::io::Error>>(),
                "waiting for nothing",
            )
            .await
        });

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out waiting for nothing"));
    }

    #[tokio::test]
    async fn passes_through_inner_errors() {
        let err = timeout_with_context(
            Duration::from_secs(1),
            async {
                Err::<(), std::io::Error>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                ))
            },
            "reading from peer",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed while reading from peer"));
    }
}
