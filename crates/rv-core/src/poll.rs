//! Bounded polling
//!
//! One suspension point per iteration and an explicit deadline. Retryable
//! remote errors count as "not yet"; anything else ends the poll.

use crate::error::PollError;
use rv_api::ApiError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Poll `probe` until it yields `Some`, the deadline passes, or a fatal error
///
/// The first probe runs immediately. The last sleep is shortened so the
/// final probe lands on the deadline rather than past it.
///
/// # Errors
/// - `PollError::TimedOut` when `timeout` elapses
/// - `PollError::Api` on a non-retryable error
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ApiError>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => tracing::debug!("{}: not yet (attempt {})", what, attempt),
            Err(e) if e.is_retryable() => {
                tracing::debug!("{}: retryable error while polling: {}", what, e);
            }
            Err(e) => return Err(PollError::Api(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut {
                what: what.to_string(),
                waited: now - started,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv_api::ApiErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let value = poll_until("ready", Duration::from_secs(60), Duration::from_secs(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ApiError>((n == 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_probe_does_not_suspend() {
        let mut task = tokio_test::task::spawn(poll_until(
            "instant",
            Duration::from_secs(60),
            Duration::from_secs(5),
            || async { Ok::<_, ApiError>(Some(7)) },
        ));
        let value = tokio_test::assert_ready!(task.poll()).unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let started = Instant::now();
        let err = poll_until("never", Duration::from_secs(12), Duration::from_secs(5), || async {
            Ok::<Option<()>, ApiError>(None)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::TimedOut { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_keep_polling() {
        let calls = AtomicU32::new(0);
        let value = poll_until("flaky", Duration::from_secs(60), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::new(ApiErrorKind::Server, "vms", "busy"))
                } else {
                    Ok(Some("up"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "up");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_ends_poll() {
        let err = poll_until("fatal", Duration::from_secs(60), Duration::from_secs(1), || async {
            Err::<Option<()>, _>(ApiError::new(ApiErrorKind::Client, "vms", "bad request"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PollError::Api(_)));
    }
}
