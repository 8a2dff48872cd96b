//! Bounded polling
//!
//! Port readiness, terminal startup and graceful-kill waits all reduce to the
//! same shape: check a condition at a fixed interval until it holds or a
//! deadline passes. [`poll_until`] is that shape.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll `predicate` every `interval` until it returns `true` or `timeout` elapses
///
/// The predicate is always evaluated at least once, and once more right at the
/// deadline, so a condition that becomes true during the final sleep is still
/// observed. Returns whether the predicate succeeded.
pub async fn poll_until<F, Fut>(mut predicate: F, interval: Duration, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_immediate_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ok = poll_until(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    true
                }
            },
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ok = poll_until(
            move || {
                let c = c.clone();
                async move { c.fetch_add(1, Ordering::SeqCst) >= 3 }
            },
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
        .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let start = std::time::Instant::now();
        let ok = poll_until(
            || async { false },
            Duration::from_millis(20),
            Duration::from_millis(100),
        )
        .await;
        assert!(!ok);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }
}
