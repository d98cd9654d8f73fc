use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
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
        .map_err(|elapsed| anyhow::Error::new(elapsed).context(format!("timed out {context}")))?
        .with_context(|| format!("failed while {context}"))
}

/// Milliseconds since the unix epoch, for the in-flight status snapshot.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_wraps_elapsed_deadline() {
        let err = timeout_with_context(
            Duration::from_millis(5),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(())
            },
            "waiting forever",
        )
        .await
        .expect_err("deadline should elapse");
        assert!(err.to_string().contains("timed out waiting forever"));
    }

    #[test]
    fn unix_millis_is_monotonic_enough() {
        let first = unix_millis();
        let second = unix_millis();
        assert!(second >= first);
    }
}
