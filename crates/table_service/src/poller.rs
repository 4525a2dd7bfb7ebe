//! Generic bounded-retry poller: drives any "not ready yet" remote job to
//! completion. See the algorithm in spec §4.1 (sleep precedes every call,
//! including the first, so a job barely submitted a moment ago doesn't burn
//! its first try on a near-certain NotReady).

use std::time::Duration;

use errors::ErrorMetadata;
use tokio::time::sleep;

/// What an `op` passed to [`poll`] may signal besides success.
#[derive(Debug)]
pub enum PollError {
    /// The job has not produced a result yet; keep polling.
    NotReady,
    /// Any other failure. Propagated immediately, no further tries.
    Other(anyhow::Error),
}

impl From<anyhow::Error> for PollError {
    fn from(e: anyhow::Error) -> Self {
        PollError::Other(e)
    }
}

/// Poll `op` until it yields a value, fails, or the try budget is
/// exhausted. `max_tries` must be > 0 ([`common::PackagerConfig`] enforces
/// this at construction, so this function trusts its caller).
pub async fn poll<T, F, Fut>(interval: Duration, max_tries: u32, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, PollError>>,
{
    for attempt in 1..=max_tries {
        if !interval.is_zero() {
            sleep(interval).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(PollError::NotReady) => {
                tracing::debug!(attempt, max_tries, "poll not ready, retrying");
                continue;
            },
            Err(PollError::Other(e)) => return Err(e),
        }
    }
    Err(anyhow::Error::new(ErrorMetadata::service_unavailable(
        "Timeout",
        format!("poll loop exhausted after {max_tries} tries"),
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicU32,
        Ordering,
    };
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn returns_value_once_ready() {
        let tries = AtomicU32::new(0);
        let result = poll(Duration::ZERO, 5, || {
            let n = tries.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PollError::NotReady)
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn propagates_other_errors_immediately() {
        let tries = AtomicU32::new(0);
        let err = poll(Duration::ZERO, 5, || {
            tries.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(PollError::Other(anyhow::anyhow!("boom"))) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let err = poll(Duration::ZERO, 3, || async { Err::<(), _>(PollError::NotReady) })
            .await
            .unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_service_unavailable(
            &err
        ));
    }
}
