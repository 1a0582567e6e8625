//! Bounded last-error-only retry loop (spec §7, Design Note on goto-based retry).

use crate::error::{BackupError, Result};
use std::future::Future;
use std::time::Duration;

/// Linear delay between attempts, matching the reference implementation's
/// `retry.Delay(10 * time.Second)`.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Runs `attempt` up to `attempts` times (minimum 1), sleeping [`RETRY_DELAY`]
/// between tries, and returns the *last* error observed if every attempt
/// fails — last-error-only semantics, as specified.
pub async fn with_retry<F, Fut, T>(attempts: u32, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err: Option<BackupError> = None;
    for try_no in 0..attempts {
        match attempt(try_no).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(try_no, attempts, error = %err, "attempt failed");
                last_err = Some(err);
                if try_no + 1 < attempts {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, |_| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BackupError>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_reports_last_error_on_exhaustion() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, |try_no| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if try_no < 2 {
                Err(BackupError::Config(format!("fail {try_no}")))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error_only() {
        let result: Result<()> = with_retry(3, |try_no| async move {
            Err(BackupError::Config(format!("fail {try_no}")))
        })
        .await;
        match result {
            Err(BackupError::Config(msg)) => assert_eq!(msg, "fail 2"),
            other => panic!("expected last error, got {other:?}"),
        }
    }
}
