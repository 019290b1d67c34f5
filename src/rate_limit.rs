use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Enforces a minimum spacing between requests to one backend.
///
/// Each backend gets its own limiter since their usage policies differ. The
/// timestamp is taken when a caller is released and again when its request
/// completes, so slow responses and retries push the next slot back.
pub struct RateLimiter {
    min_interval: Duration,
    last_request: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: AsyncMutex::new(None),
        }
    }

    pub fn from_millis(min_interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_interval_ms))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspends the caller until `min_interval` has passed since the last request.
    pub async fn wait_if_needed(&self) {
        let mut guard = self.last_request.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                trace!(?remaining, "rate limiter holding request");
                sleep(remaining).await;
            }
        }
        *guard = Some(Instant::now());
    }

    /// Records that the request released by the last `wait_if_needed` has finished.
    pub async fn mark_completed(&self) {
        *self.last_request.lock().await = Some(Instant::now());
    }

    pub async fn last_request(&self) -> Option<Instant> {
        *self.last_request.lock().await
    }

    /// Worst-case wall-clock time for `requests` sequential calls.
    pub fn estimate(&self, requests: usize) -> Duration {
        self.min_interval
            .saturating_mul(u32::try_from(requests).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_request_is_not_delayed() {
        let limiter = RateLimiter::from_millis(500);
        let started = Instant::now();
        limiter.wait_if_needed().await;
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn spaces_consecutive_requests() {
        let interval = Duration::from_millis(40);
        let limiter = RateLimiter::new(interval);
        let started = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..4 {
            limiter.wait_if_needed().await;
            stamps.push(limiter.last_request().await.unwrap());
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
        assert!(started.elapsed() >= interval * 3);
    }

    #[tokio::test]
    async fn measures_from_request_completion() {
        let interval = Duration::from_millis(60);
        let limiter = RateLimiter::new(interval);
        limiter.wait_if_needed().await;
        sleep(Duration::from_millis(40)).await;
        limiter.mark_completed().await;
        let completed = Instant::now();

        limiter.wait_if_needed().await;
        assert!(completed.elapsed() >= interval - Duration::from_millis(5));
    }

    #[test]
    fn estimates_batch_duration() {
        let limiter = RateLimiter::from_millis(10_000);
        assert_eq!(limiter.estimate(6), Duration::from_secs(60));
        assert_eq!(limiter.estimate(0), Duration::ZERO);
    }
}
