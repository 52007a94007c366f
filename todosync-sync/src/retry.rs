//! Bounded exponential-backoff retries for transient failures.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use todosync_core::RetrySettings;

use crate::error::SyncError;

/// Successful result plus how many attempts it took (1 = first try).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: f64,
    total_retries: AtomicU64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter.clamp(0.0, 1.0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), without jitter:
    /// `base * multiplier^(attempt-1)`, capped at the max delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.as_millis() as f64 * self.jitter * rand::rng().random_range(0.0..=1.0);
        delay + Duration::from_millis(extra as u64)
    }

    /// Retries performed over the policy's lifetime.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// `max_attempts` attempts have been made. The final error is returned
    /// unchanged. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<RetryOutcome<T>, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                    })
                }
                Err(e) if !e.is_transient() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_with_jitter(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
