use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Call `f` up to `max_attempts` times, sleeping `base_delay_ms * 2^(attempt-1)`
/// between failures. Returns the first success or the error of the final attempt.
///
/// `max_attempts` of 0 is treated as 1.
pub async fn with_retry<T, E, F, Fut>(mut f: F, max_attempts: u32, base_delay_ms: u64) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(32));
                warn!(attempt, max_attempts, delay_ms = delay, error = %e, "attempt failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let out: Result<&str, String> = with_retry(
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("fail {n}"))
                } else {
                    Ok("done")
                }
            },
            3,
            1000,
        )
        .await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1000 ms after the first failure, 2000 ms after the second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), String> = with_retry(
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("fail {n}"))
            },
            3,
            10,
        )
        .await;
        assert_eq!(out.unwrap_err(), "fail 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_attempt_never_sleeps() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), String> = with_retry(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            },
            0,
            60_000,
        )
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
