//! Exponential-backoff retry of any fallible operation, with jitter,
//! deadline, and cancellation.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ErrorKind, Result};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Wall-clock budget across all attempts. `None` = unbounded.
    pub max_duration: Option<Duration>,
    /// Multiply each delay by a uniform factor in [0.5, 1.5).
    pub jitter: bool,
    /// Set-membership predicate on the error kind.
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_duration: None,
            jitter: true,
            retryable: [ErrorKind::Transient, ErrorKind::Timeout].into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// N attempts with a fixed base interval; the common per-node shape
    /// (`retry_times` / `retry_interval`).
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            ..Self::default()
        }
    }

    /// Delay before the retry following failed attempt `attempt`
    /// (1-based): `min(initial · multiplier^(attempt-1), max)`, with
    /// jitter applied when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_interval.as_millis() as f64);
        let final_ms = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_millis(final_ms.max(0.0) as u64)
    }
}

/// Observation hooks for retry progress.
#[derive(Default)]
pub struct RetryCallbacks {
    pub on_retry: Option<Box<dyn Fn(u32, &EngineError) + Send + Sync>>,
    pub on_success: Option<Box<dyn Fn(u32) + Send + Sync>>,
    pub on_max_attempts_reached: Option<Box<dyn Fn(&EngineError) + Send + Sync>>,
}

impl RetryCallbacks {
    fn retrying(&self, attempt: u32, err: &EngineError) {
        if let Some(f) = &self.on_retry {
            f(attempt, err);
        }
    }

    fn succeeded(&self, attempt: u32) {
        if let Some(f) = &self.on_success {
            f(attempt);
        }
    }

    fn exhausted(&self, err: &EngineError) {
        if let Some(f) = &self.on_max_attempts_reached {
            f(err);
        }
    }
}

/// Execute `op` until it succeeds, exhausts `max_attempts`, exceeds
/// `max_duration`, hits a non-retryable error, or `token` fires —
/// whichever happens first.
///
/// Attempt exhaustion surfaces the last error wrapped as
/// `MaxAttemptsExceeded`; deadline exhaustion wraps it as `Timeout`.
/// Cancellation returns `Cancelled` without invoking
/// `on_max_attempts_reached`.
pub async fn retry<T, F, Fut>(
    token: &CancellationToken,
    cfg: &RetryConfig,
    callbacks: &RetryCallbacks,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = token.cancelled() => {
                return Err(EngineError::Cancelled("retry scope cancelled".into()));
            }
            r = op(attempt) => r,
        };

        let err = match result {
            Ok(value) => {
                callbacks.succeeded(attempt);
                return Ok(value);
            }
            Err(e) => e,
        };

        if !cfg.retryable.contains(&err.kind()) {
            return Err(err);
        }
        if attempt >= cfg.max_attempts {
            callbacks.exhausted(&err);
            return Err(EngineError::MaxAttemptsExceeded(err.to_string()));
        }
        if let Some(max) = cfg.max_duration {
            if start.elapsed() >= max {
                return Err(EngineError::Timeout(format!(
                    "retry deadline exceeded after {attempt} attempts: {err}"
                )));
            }
        }

        callbacks.retrying(attempt, &err);
        let delay = cfg.delay_for_attempt(attempt);
        tokio::select! {
            _ = token.cancelled() => {
                return Err(EngineError::Cancelled("retry scope cancelled".into()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
