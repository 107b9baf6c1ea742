use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::error::Error;

/// Backoff schedule; its length is the attempt budget.
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Run a network primitive with bounded retries.
///
/// Sleeps follow the schedule between attempts; after the final failure the
/// last error is surfaced as [`Error::Network`] tagged with the operation
/// name. Dropping the returned future (caller cancellation) aborts at the
/// next await point, including mid-backoff.
pub(crate) async fn with_retry<T, F, Fut>(op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for (attempt, backoff) in BACKOFF.iter().enumerate() {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(op, attempt = attempt + 1, error = %err, "network call failed");
                last = Some(err);
                if attempt + 1 < BACKOFF.len() {
                    tokio::time::sleep(*backoff).await;
                }
            }
        }
    }
    Err(Error::Network {
        op,
        attempts: BACKOFF.len(),
        source: last.unwrap_or_else(|| anyhow::anyhow!("no attempts were made")),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn flaky(calls: &AtomicUsize, failures: usize) -> Result<usize> {
        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= failures {
            anyhow::bail!("transient failure {attempt}")
        }
        Ok(attempt)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("flaky op", || flaky(&calls, 2)).await.unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_surfaces_network_error() {
        let calls = AtomicUsize::new(0);
        let err = with_retry("doomed op", || flaky(&calls, 4))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "budget is three attempts");
        match err.downcast_ref::<Error>() {
            Some(Error::Network { op, attempts, .. }) => {
                assert_eq!(*op, "doomed op");
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected Network error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_skips_backoff() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let result = with_retry("healthy op", || flaky(&calls, 0)).await.unwrap();
        assert_eq!(result, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
