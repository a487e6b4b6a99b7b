//! Bounded retries with exponential backoff.
//!
//! Only failures classified as transient are retried. A fatal failure is
//! returned immediately; a transient failure that survives every attempt is
//! returned as [`RetryError::Exhausted`] so the caller can re-classify it.
//! Backoff sleeps end early when the caller's cancellation token fires.
//!
//! ```text
//! attempt 1 ─ fail ─ sleep base ─ attempt 2 ─ fail ─ sleep base*m ─ attempt 3 ─ fail ─► Exhausted
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly shaved off (0 = none).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 2s initial backoff, 2x multiplier, 60s max, no jitter.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Another attempt follows after `delay`.
    Retrying { delay: Duration },
    /// The failure was transient but no attempts remain.
    Exhausted,
    /// The failure is not retryable.
    Fatal,
}

/// Failure returned by [`RetryPolicy::run`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError<E> {
    #[error("fatal error on attempt {attempt}: {error}")]
    Fatal { attempt: u32, error: E },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("cancelled during backoff after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal { error, .. } => error,
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "retry.max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(format!(
                "retry.jitter_ratio must be within 0–1, got {}",
                self.jitter_ratio
            ));
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (1-based), capped at `max_delay_ms`.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(retry as i32 - 1);
        if !delay.is_finite() {
            return self.max_delay_ms;
        }
        (delay as u64).min(self.max_delay_ms)
    }

    /// Delay before retry number `retry`, with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff_ms(retry);
        if self.jitter_ratio <= 0.0 || base == 0 {
            return Duration::from_millis(base);
        }
        let shaved = base as f64 * self.jitter_ratio * rand::random::<f64>();
        Duration::from_millis(base.saturating_sub(shaved as u64))
    }

    /// Decide what follows failed attempt number `attempt` (1-based).
    pub fn disposition(&self, attempt: u32, transient: bool) -> RetryDisposition {
        if !transient {
            RetryDisposition::Fatal
        } else if attempt >= self.max_attempts {
            RetryDisposition::Exhausted
        } else {
            RetryDisposition::Retrying {
                delay: self.delay_for(attempt),
            }
        }
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    pub async fn run<T, E, F, Fut, C>(&self, op: F, is_transient: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_observed(op, is_transient, |_, _, _| {}, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but a fired `cancel` cuts any backoff short.
    pub async fn run_cancellable<T, E, F, Fut, C>(
        &self,
        op: F,
        is_transient: C,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_observed(op, is_transient, |_, _, _| {}, cancel)
            .await
    }

    /// The retry loop. Every failed attempt is reported to `on_failure` before
    /// the policy backs off; cancellation during backoff returns
    /// [`RetryError::Cancelled`] without another attempt.
    pub async fn run_observed<T, E, F, Fut, C, O>(
        &self,
        mut op: F,
        is_transient: C,
        mut on_failure: O,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        O: FnMut(u32, &E, RetryDisposition),
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let disposition = self.disposition(attempt, is_transient(&error));
            on_failure(attempt, &error, disposition);
            match disposition {
                RetryDisposition::Fatal => return Err(RetryError::Fatal { attempt, error }),
                RetryDisposition::Exhausted => {
                    warn!(attempt, error = %error, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                RetryDisposition::Retrying { delay } => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient error, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            warn!(attempt, "Backoff interrupted by cancellation");
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last: error,
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience wrapper: build a policy from the three headline knobs and run `op`.
pub async fn run_with_retry<T, E, F, Fut, C>(
    op: F,
    is_transient: C,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    RetryPolicy::new(max_attempts, base_delay, max_delay)
        .run(op, is_transient)
        .await
}
