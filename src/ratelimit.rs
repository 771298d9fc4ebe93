//! Rate Limiter (C3, spec.md §4.3). A token bucket sustaining `qps` tokens/sec
//! with burst capacity `burst`, starting full. Cancellation unblocks every
//! waiter the way the worker-pool/watcher cancellation token pattern does
//! elsewhere in this crate.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::RateLimitError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One rate limiter per job (spec.md §4.3).
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    cancel: CancellationToken,
}

impl RateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = qps.max(1) as f64;
        let burst = burst.max(1) as f64;
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last_refill: Instant::now() }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn try_take(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available, or the job is cancelled.
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            if self.try_take() {
                return Ok(());
            }
            // Token deficit is always < 1; sleeping one token-period is enough
            // to guarantee forward progress without busy-spinning.
            let period = Duration::from_secs_f64((1.0 / self.qps).max(0.001));
            tokio::select! {
                () = sleep(period) => {}
                () = self.cancel.cancelled() => return Err(RateLimitError::Cancelled),
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn bucket_starts_full_and_allows_burst_immediately() {
        let limiter = RateLimiter::new(5, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200), "burst should not block");
    }

    #[tokio::test]
    async fn sixth_acquire_blocks_until_refill() {
        let limiter = RateLimiter::new(10, 5);
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        let start = Instant::now();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50), "must wait for a token to refill");
    }

    #[tokio::test]
    async fn observed_qps_stays_within_configured_bound_plus_burst() {
        let qps = 20;
        let burst = 5;
        let limiter = Arc::new(RateLimiter::new(qps, burst));
        let start = Instant::now();
        let window = Duration::from_secs(1);
        let mut count = 0usize;
        while start.elapsed() < window {
            limiter.acquire().await.unwrap();
            count += 1;
        }
        // Allow generous scheduling slack; the invariant under test is the ceiling.
        assert!(
            count as f64 <= (qps + burst) as f64 * 1.5,
            "observed {count} acquisitions in one window, expected <= ~{}",
            qps + burst
        );
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let limiter = Arc::new(RateLimiter::new(1, 1));
        limiter.acquire().await.unwrap(); // drain the single token
        limiter.cancel();
        let result = limiter.acquire().await;
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
    }
}
