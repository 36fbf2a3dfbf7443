//! Retry harness with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{MoltError, Result};

/// Backoff configuration for a retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Sleep before the first retry.
    pub initial_backoff: Duration,
    /// Factor applied to the backoff after each failed attempt. Must be >= 1.
    pub multiplier: u32,
    /// Upper bound on any single backoff. Zero means uncapped.
    pub max_backoff: Duration,
    /// Number of retries after the initial attempt.
    pub max_retries: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

/// Executes a fallible operation under [`RetrySettings`].
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    settings: RetrySettings,
}

impl Retry {
    /// Create a retry harness, validating the settings.
    pub fn new(settings: RetrySettings) -> Result<Self> {
        if settings.multiplier < 1 {
            return Err(MoltError::Config(format!(
                "retry multiplier must be at least 1, got {}",
                settings.multiplier
            )));
        }
        Ok(Self { settings })
    }

    /// Run `body` until it succeeds or retries are exhausted.
    ///
    /// On each failure `on_failure` observes the error, then the loop sleeps
    /// `min(initial * multiplier^k, max_backoff)` before the next attempt.
    /// Returns the last error once `max_retries` is exhausted.
    pub async fn do_with<T, F, Fut, H>(&self, mut body: F, mut on_failure: H) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        H: FnMut(&MoltError),
    {
        let mut backoff = self.settings.initial_backoff;
        let mut attempt: u64 = 0;
        loop {
            match body().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    on_failure(&e);
                    if attempt >= self.settings.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(self.settings.multiplier);
                    if self.settings.max_backoff > Duration::ZERO
                        && backoff > self.settings.max_backoff
                    {
                        backoff = self.settings.max_backoff;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_zero_multiplier_rejected() {
        let err = Retry::new(RetrySettings {
            multiplier: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, MoltError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let r = Retry::new(RetrySettings {
            initial_backoff: Duration::from_millis(10),
            multiplier: 2,
            max_backoff: Duration::from_millis(40),
            max_retries: 5,
        })
        .unwrap();

        let attempts = AtomicU64::new(0);
        let failures = AtomicU64::new(0);
        let result = r
            .do_with(
                || async {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(MoltError::assertion("not yet"))
                    } else {
                        Ok(42)
                    }
                },
                |_| {
                    failures.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let r = Retry::new(RetrySettings {
            initial_backoff: Duration::from_millis(1),
            multiplier: 1,
            max_backoff: Duration::ZERO,
            max_retries: 2,
        })
        .unwrap();

        let attempts = AtomicU64::new(0);
        let err = r
            .do_with(
                || async {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MoltError::assertion(format!("attempt {}", n)))
                },
                |_| {},
            )
            .await
            .unwrap_err();
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("attempt 2"));
    }
}
