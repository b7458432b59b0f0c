//! Retry helpers for fallible async calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Run `op` up to `times` times, sleeping `pause` between attempts.
pub async fn retry_times<T, E, F, Fut>(times: u32, pause: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let times = times.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < times => {
                tracing::warn!(error = %e, "call {attempt}/{times} failed, retrying");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`retry_times`] but the pause doubles after each failure, capped at `max`.
pub async fn retry_backoff<T, E, F, Fut>(
    initial: Duration,
    max: Duration,
    times: u32,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let times = times.max(1);
    let mut pause = initial;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < times => {
                tracing::warn!(error = %e, pause_ms = pause.as_millis() as u64, "call {attempt}/{times} failed, backing off");
                tokio::time::sleep(pause).await;
                pause = (pause * 2).min(max);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_times_stops_on_first_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<u32, String> = retry_times(5, Duration::from_millis(1), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(out, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_times_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), String> = retry_times(2, Duration::from_millis(1), move || async move {
            Err(format!("fail {}", calls.fetch_add(1, Ordering::SeqCst)))
        })
        .await;
        assert_eq!(out, Err("fail 1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_caps_pause() {
        let start = tokio::time::Instant::now();
        let out: Result<(), &str> = retry_backoff(
            Duration::from_millis(500),
            Duration::from_secs(1),
            4,
            || async { Err("nope") },
        )
        .await;
        assert!(out.is_err());
        // 0.5 + 1 + 1 seconds of pauses between four attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }
}
