// src/ingest/retry.rs
//! Exponential backoff with jitter around any async operation.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ingest::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Deterministic part of the wait after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay().saturating_mul(factor).min(self.max_delay())
    }

    /// Uniform in `[0, base_delay)`.
    fn jitter(&self) -> Duration {
        if self.base_delay_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..self.base_delay_ms))
    }

    /// A server-suggested delay replaces the backoff but is still bounded by
    /// `max_delay`.
    fn delay_for(&self, attempt: u32, err: &IngestError) -> Duration {
        match err.retry_after() {
            Some(server_hint) => server_hint.min(self.max_delay()),
            None => self.backoff(attempt) + self.jitter(),
        }
    }
}

/// Outcome of `execute_counted`: the final result and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, IngestError>,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` until it succeeds, fails non-retryably, or `max_attempts` is spent.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    execute_counted(policy, label, op).await.result
}

pub async fn execute_counted<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let total_t0 = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(v) => {
                return Attempted {
                    result: Ok(v),
                    attempts: attempt,
                }
            }
            Err(e) if !e.is_retryable() => {
                tracing::debug!(target: "ingest", op = label, attempt, error = %e, "non-retryable failure");
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    target: "ingest",
                    op = label,
                    attempt,
                    max = max_attempts,
                    elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                    error = %e,
                    "retries exhausted"
                );
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Err(e) => {
                let delay = policy.delay_for(attempt, &e);
                tracing::warn!(
                    target: "ingest",
                    op = label,
                    attempt,
                    max = max_attempts,
                    ?delay,
                    error = %e,
                    "attempt failed; backing off"
                );
                counter!("ingest_retries_total").increment(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_below_base() {
        let p = RetryPolicy::new(3, Duration::from_millis(50));
        for _ in 0..200 {
            assert!(p.jitter() < Duration::from_millis(50));
        }
        assert_eq!(RetryPolicy::new(3, Duration::ZERO).jitter(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let p = RetryPolicy::new(5, Duration::from_millis(10));
        let out = execute_counted(&p, "t", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(IngestError::Server(503))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(*out.result.as_ref().unwrap(), 3);
        assert_eq!(out.attempts, 3);
        assert_eq!(out.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_replaces_backoff() {
        let calls = &AtomicU32::new(0);
        let p = RetryPolicy::new(2, Duration::from_millis(10));
        let t0 = Instant::now();
        let r = execute(&p, "t", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IngestError::RateLimited {
                    retry_after: Some(Duration::from_secs(3)),
                })
            } else {
                Ok(())
            }
        })
        .await;
        assert!(r.is_ok());
        assert!(t0.elapsed() >= Duration::from_secs(3));
        assert!(t0.elapsed() < Duration::from_millis(3_100));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_capped_by_max_delay() {
        let calls = &AtomicU32::new(0);
        let p = RetryPolicy::new(2, Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(60));
        let t0 = Instant::now();
        let r = execute(&p, "t", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(IngestError::RateLimited {
                    retry_after: Some(Duration::from_secs(86_400)),
                })
            } else {
                Ok(())
            }
        })
        .await;
        assert!(r.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(t0.elapsed() >= Duration::from_secs(60));
        assert!(t0.elapsed() < Duration::from_secs(61));
    }
}
