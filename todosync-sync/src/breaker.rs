//! Per-operation circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures inside the
//! failure window. Open rejects calls without running them until the
//! cooldown has passed, then lets a single probe through (Half-Open). The
//! probe's success closes the breaker; any counted failure re-opens it.
//! Errors for which [`SyncError::counts_as_failure`] is false (validation,
//! parse) never move the breaker.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use todosync_core::BreakerSettings;

use crate::error::SyncError;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed {
        failures: u32,
        streak_started: Option<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            name: name.into(),
            threshold: settings.failure_threshold.max(1),
            window: Duration::from_millis(settings.failure_window_ms),
            cooldown: Duration::from_millis(settings.cooldown_ms),
            state: Mutex::new(CircuitState::Closed {
                failures: 0,
                streak_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose cooldown elapsed reports
    /// `HalfOpen` even before the next call arrives.
    pub fn state(&self) -> BreakerState {
        match *self.state.lock() {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { since } if since.elapsed() >= self.cooldown => BreakerState::HalfOpen,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Run `op` through the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.counts_as_failure() => self.on_failure(),
            Err(_) => self.on_ignored(),
        }
        result
    }

    fn acquire(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed { .. } => Ok(()),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cooldown {
                    info!(breaker = %self.name, "circuit half-open; probing");
                    *state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(self.open_error(self.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen {
                probe_in_flight: true,
            } => Err(self.open_error(Duration::ZERO)),
            CircuitState::HalfOpen {
                probe_in_flight: false,
            } => {
                *state = CircuitState::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, CircuitState::Closed { failures: 0, .. }) {
            if matches!(*state, CircuitState::HalfOpen { .. }) {
                info!(breaker = %self.name, "circuit closed after successful probe");
            }
            *state = CircuitState::Closed {
                failures: 0,
                streak_started: None,
            };
        }
    }

    fn on_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let next = match *state {
            CircuitState::Closed {
                failures,
                streak_started,
            } => {
                let (failures, started) = match streak_started {
                    Some(start) if now.duration_since(start) <= self.window => (failures + 1, start),
                    _ => (1, now),
                };
                if failures >= self.threshold {
                    warn!(
                        breaker = %self.name,
                        failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    CircuitState::Open { since: now }
                } else {
                    CircuitState::Closed {
                        failures,
                        streak_started: Some(started),
                    }
                }
            }
            CircuitState::HalfOpen { .. } => {
                warn!(breaker = %self.name, "probe failed; circuit re-opened");
                CircuitState::Open { since: now }
            }
            open @ CircuitState::Open { .. } => open,
        };
        *state = next;
    }

    fn on_ignored(&self) {
        let mut state = self.state.lock();
        if let CircuitState::HalfOpen { .. } = *state {
            *state = CircuitState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    fn open_error(&self, retry_after: Duration) -> SyncError {
        SyncError::CircuitOpen {
            operation: self.name.clone(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::io_err;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), SyncError> {
        breaker
            .call(|| async { Err(io_err("write", "/t", ErrorKind::PermissionDenied.into())) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_skips_the_operation() {
        let breaker = CircuitBreaker::new("fs", &settings());
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let err = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("db", &settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("db", &settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_accumulate() {
        let breaker = CircuitBreaker::new("fs", &settings());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_never_count() {
        let breaker = CircuitBreaker::new("fs", &settings());
        for _ in 0..10 {
            let _ = breaker
                .call(|| async { Err::<(), _>(SyncError::Validation("bad".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new("fs", &settings());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        breaker.call(|| async { Ok(()) }).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
