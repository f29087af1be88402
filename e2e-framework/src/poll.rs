//! Poll-until-converged primitive
//!
//! Every wait in the harness goes through [`poll_until`]: the check runs
//! immediately, then once per interval, until it reports done, fails
//! fatally, or the timeout elapses. Retryable API errors count as "not yet".

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{E2eError, Result};
use crate::metrics;

/// Interval and deadline of a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Same interval with a different deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// The condition holds.
    Done(T),
    /// Not converged yet; carries the observed state for diagnostics.
    NotYet(String),
}

impl<T> Progress<T> {
    pub fn not_yet(state: impl Into<String>) -> Self {
        Progress::NotYet(state.into())
    }
}

/// Poll `check` until it returns [`Progress::Done`].
///
/// A check error that is retryable is treated like `NotYet`; any other
/// error aborts the wait. When the deadline passes the returned
/// [`E2eError::Timeout`] carries the last observed state.
pub async fn poll_until<T, F, Fut>(settings: PollSettings, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    let start = Instant::now();
    let mut last_state = String::from("no observation");
    let mut iterations = 0u64;

    loop {
        iterations += 1;
        match check().await {
            Ok(Progress::Done(value)) => {
                let elapsed = start.elapsed();
                if iterations > 1 {
                    info!(what, elapsed_secs = elapsed.as_secs(), iterations, "Wait completed");
                }
                metrics::record_poll("done", iterations);
                return Ok(value);
            }
            Ok(Progress::NotYet(state)) => last_state = state,
            Err(e) if e.is_retryable() => {
                debug!(what, error = %e, "Retryable error while waiting");
                last_state = format!("retryable error: {}", e);
            }
            Err(e) => {
                warn!(what, elapsed_secs = start.elapsed().as_secs(), error = %e, "Wait aborted");
                metrics::record_poll("fatal", iterations);
                return Err(e);
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            warn!(what, elapsed_secs = elapsed.as_secs(), last_state = %last_state, "Wait timed out");
            metrics::record_poll("timeout", iterations);
            return Err(E2eError::Timeout {
                what: what.to_string(),
                elapsed,
                last_state,
            });
        }

        debug!(
            what,
            elapsed_secs = elapsed.as_secs(),
            state = %last_state,
            "Waiting"
        );
        // Last sleep is clipped so the final check lands on the deadline
        tokio::time::sleep(settings.interval.min(settings.timeout - elapsed)).await;
    }
}

/// Creation-phase lookup: a missing object has not appeared yet.
pub fn present<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletion-phase lookup: a missing object means the wait is over.
pub fn gone<T>(result: Result<T>, what: &str) -> Result<Progress<()>> {
    match result {
        Ok(_) => Ok(Progress::NotYet(format!("{} still present", what))),
        Err(e) if e.is_not_found() => Ok(Progress::Done(())),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(timeout_ms: u64) -> PollSettings {
        PollSettings::new(Duration::from_millis(5), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_done_immediately_does_not_sleep() {
        let settings = PollSettings::new(Duration::from_secs(60), Duration::from_secs(600));
        let start = Instant::now();
        let value = poll_until(settings, "ready", || async { Ok(Progress::Done(7)) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_not_yet_then_done() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(fast(1000), "counter", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Ok(Progress::not_yet(format!("n={}", n)))
                } else {
                    Ok(Progress::Done(n))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_carries_last_state() {
        let err = poll_until::<(), _, _>(fast(30), "pvc bound", || async {
            Ok(Progress::not_yet("phase Pending"))
        })
        .await
        .unwrap_err();
        match err {
            E2eError::Timeout { what, last_state, .. } => {
                assert_eq!(what, "pvc bound");
                assert_eq!(last_state, "phase Pending");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retryable_error_is_not_yet() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(fast(1000), "flaky", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(E2eError::RetryableApi("connection reset".into()))
                } else {
                    Ok(Progress::Done(()))
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = poll_until::<(), _, _>(fast(1000), "pod running", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(E2eError::mismatch("pod completed"))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, E2eError::ClusterMismatch(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_checks_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = poll_until::<(), _, _>(fast(0), "never", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Progress::not_yet("nope"))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, E2eError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_phase_classification() {
        let missing: Result<u32> = Err(E2eError::NotFound("pvc".into()));
        assert_eq!(present(missing).unwrap(), None);

        let missing: Result<u32> = Err(E2eError::NotFound("pvc".into()));
        assert_eq!(gone(missing, "pvc").unwrap(), Progress::Done(()));

        let still_there: Result<u32> = Ok(1);
        assert!(matches!(gone(still_there, "pvc").unwrap(), Progress::NotYet(_)));

        let forbidden: Result<u32> = Err(E2eError::Api("forbidden".into()));
        assert!(present(forbidden).is_err());
    }
}
