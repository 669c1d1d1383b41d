//! Exponential backoff shared by publishers and the reconnection supervisor.
//!
//! The schedule is fixed: a failed attempt 0 sleeps 1 ms, a failed attempt
//! i ≥ 1 sleeps `2^i × 100 ms`. Publishers run up to [`PUBLISH_ATTEMPTS`]
//! attempts per publish; the reconnection supervisor runs
//! [`DIAL_ATTEMPTS`]-attempt blocks in an endless loop.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;

use super::{BusError, Result};

/// Attempts per publish call.
pub(crate) const PUBLISH_ATTEMPTS: usize = 3;

/// Attempts per dial block; the supervisor loops blocks indefinitely.
pub(crate) const DIAL_ATTEMPTS: usize = 10;

/// Sleep durations indexed by failed attempt: 1ms, 200ms, 400ms, 800ms, …
pub(crate) fn backoff_delays(max_attempts: usize) -> impl Iterator<Item = Duration> {
    let tail = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_factor(2.0)
        .with_max_delay(Duration::from_secs(60))
        .with_max_times(max_attempts.saturating_sub(1))
        .build();
    std::iter::once(Duration::from_millis(1))
        .chain(tail)
        .take(max_attempts)
}

/// Runs `operation` up to `max_attempts` times, sleeping the schedule after
/// each failure. Returns the last error when every attempt fails.
pub(crate) async fn with_backoff<T, F, Fut>(
    max_attempts: usize,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for (attempt, delay) in backoff_delays(max_attempts).enumerate() {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    operation = what,
                    attempt,
                    sleep_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(last_error.unwrap_or(BusError::Closed))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn schedule_starts_at_one_millisecond_then_doubles() {
        let delays: Vec<u128> = backoff_delays(5).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![1, 200, 400, 800, 1600]);
    }

    #[test]
    fn schedule_length_matches_attempts() {
        assert_eq!(backoff_delays(PUBLISH_ATTEMPTS).count(), 3);
        assert_eq!(backoff_delays(DIAL_ATTEMPTS).count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = with_backoff(3, "test.op", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BusError::Publish("transient".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt should succeed"), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let result: Result<()> = with_backoff(2, "test.op", || async {
            Err(BusError::Publish("always down".to_string()))
        })
        .await;

        let err = result.expect_err("all attempts fail");
        assert!(matches!(err, BusError::Publish(_)));
    }
}
