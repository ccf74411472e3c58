//! Bounded polling until an async probe reports ready.
//!
//! Used by the sandbox creator to wait for the container's SSH endpoint after
//! start, and reusable anywhere a "poll until up, give up after a deadline"
//! loop is needed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("readiness probe did not succeed within {0:?}")]
    TimedOut(Duration),
}

/// A yes/no readiness probe. Implementations must be cheap to retry; failures
/// carry no detail because the caller only acts on eventual success.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

#[async_trait]
impl<F, Fut> ReadinessProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = bool> + Send,
{
    async fn is_ready(&self) -> bool {
        self().await
    }
}

/// Poll `probe` every `interval` until it reports ready or `timeout` elapses.
///
/// The probe runs immediately on entry, so a service that is already up
/// resolves without sleeping. The deadline is checked before each retry; a
/// probe that is mid-flight when the deadline passes is allowed to finish.
pub async fn wait_for_ready(
    probe: &dyn ReadinessProbe,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ReadinessError> {
    let deadline = Instant::now() + timeout;
    loop {
        if probe.is_ready().await {
            return Ok(());
        }
        if Instant::now() + interval > deadline {
            return Err(ReadinessError::TimedOut(timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn returns_immediately_when_already_ready() {
        let result = wait_for_ready(
            &|| async { true },
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .await;
        assert_matches!(result, Ok(()));
    }

    #[tokio::test]
    async fn retries_until_probe_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let probe = move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
        };
        let result = wait_for_ready(
            &probe,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert_matches!(result, Ok(()));
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_deadline() {
        let result = wait_for_ready(
            &|| async { false },
            Duration::from_millis(10),
            Duration::from_millis(30),
        )
        .await;
        assert_matches!(result, Err(ReadinessError::TimedOut(_)));
    }
}
