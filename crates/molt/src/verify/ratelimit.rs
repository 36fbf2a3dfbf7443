//! Token-bucket rate limiting for verify scans.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A token bucket refilled at `rate` tokens per second, with a burst equal
/// to one second of tokens. One token is one scanned row.
pub struct RateLimiter {
    rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rows_per_second: usize) -> Self {
        let rate = rows_per_second as f64;
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, sleeping until the bucket can cover them.
    pub async fn wait(&self, n: usize) {
        let needed = n as f64;
        loop {
            let sleep_for = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.rate.max(needed));
                state.last_refill = now;
                if state.tokens >= needed {
                    state.tokens -= needed;
                    return;
                }
                Duration::from_secs_f64((needed - state.tokens) / self.rate)
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_passes_without_sleeping() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.wait(1000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(100);
        limiter.wait(100).await;
        let start = tokio::time::Instant::now();
        // The bucket is empty; the next 100 tokens take about a second.
        limiter.wait(100).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
