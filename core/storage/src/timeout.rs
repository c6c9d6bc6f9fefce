//! Time limits for store calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use mqvault_common::{Error, Result};

/// Run a store call with an optional time limit.
///
/// On expiry the call is dropped and `Timeout` is returned. Nothing is
/// retried. Stores keep their atomicity guarantee when a call is dropped
/// midway: the local store leaves at most a temp file behind, which is
/// cleaned up the next time it is opened.
pub async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "Store call timed out");
                Err(Error::Timeout(limit))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result = bounded(Some(Duration::from_secs(1)), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<()> = bounded(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_no_limit_keeps_errors() {
        let result: Result<()> =
            bounded(None, async { Err(Error::NotFound("k".to_string())) }).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
