// Copyright 2023 Oxide Computer Company
use std::future::Future;
use std::time::Duration;

use sep_common::SepError;
use tokio::time::{sleep, Instant};

/// Re-run `check` every `interval` until it returns true
///
/// The check always runs at least once.  An error from `check` ends the
/// wait immediately.  Running out of time is [`SepError::Timeout`], which
/// callers treat as fatal.
pub async fn poll_until<F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<(), SepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, SepError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SepError::Timeout(format!(
                "{} after {:?}",
                what,
                start.elapsed()
            )));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_true() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        poll_until(
            "third call",
            Duration::from_millis(500),
            Duration::from_secs(30),
            || async { Ok(calls.fetch_add(1, Ordering::Relaxed) == 2) },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let e = poll_until(
            "never",
            Duration::from_millis(100),
            Duration::from_secs(2),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert!(e.is_timeout());
        assert!(e.to_string().contains("never"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_ends_wait() {
        let e = poll_until(
            "missing object",
            Duration::from_millis(100),
            Duration::from_secs(2),
            || async { Err(SepError::NotConfigured) },
        )
        .await
        .unwrap_err();
        assert_eq!(e, SepError::NotConfigured);
    }
}
