//! Retry with configurable backoff
//!
//! Pure delay calculation plus an async executor that records an attempt
//! history. Retryability is decided by the typed [`ErrorKind`] of the
//! failure, matched against the configured retryable set.

use crate::clock::Clock;
use crate::error::{AuditError, ErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`
    Exponential,
    /// `base * attempt`, capped at `max_delay`
    Linear,
    /// Always `base_delay`
    Fixed,
}

/// Retry policy for one class of operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the initial attempt (total calls = max_retries + 1)
    pub max_retries: u32,

    /// How the delay grows between attempts
    pub backoff_strategy: BackoffStrategy,

    /// Base delay in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Multiply each delay by a uniform factor in [0.8, 1.2]
    pub jitter: bool,

    /// Error kinds considered transient
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: true,
            retryable_kinds: vec![
                ErrorKind::NetworkReset,
                ErrorKind::Timeout,
                ErrorKind::Deadlock,
                ErrorKind::PoolExhausted,
            ],
        }
    }
}

impl RetryConfig {
    /// Whether an error is transient under this policy
    pub fn is_retryable(&self, error: &AuditError) -> bool {
        self.retryable_kinds.contains(&error.kind())
    }
}

/// One failed call within a processing attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 1-based attempt number
    pub attempt: u32,

    /// Rendered error from this call
    pub error: String,

    /// Classified kind of the error
    pub kind: ErrorKind,

    /// Delay waited before this attempt, in milliseconds (0 for the first)
    pub delay_since_ms: u64,

    /// ISO-8601 timestamp when the attempt failed
    pub timestamp: String,
}

/// Outcome of a retried operation: the final result plus the full history
/// of failed calls. A first-call success carries an empty history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, AuditError>,
    pub attempts: Vec<RetryAttempt>,
}

impl<T> RetryOutcome<T> {
    /// Whether the operation ultimately succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Compute the backoff delay before the given attempt (1-based)
///
/// Deterministic unless `jitter` is enabled, in which case the delay is
/// multiplied by a uniform factor in [0.8, 1.2].
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let attempt = attempt.max(1);
    let base = match config.backoff_strategy {
        BackoffStrategy::Exponential => {
            let factor = 2u64.saturating_pow(attempt - 1);
            config
                .base_delay_ms
                .saturating_mul(factor)
                .min(config.max_delay_ms)
        }
        BackoffStrategy::Linear => config
            .base_delay_ms
            .saturating_mul(attempt as u64)
            .min(config.max_delay_ms),
        BackoffStrategy::Fixed => config.base_delay_ms,
    };

    let millis = if config.jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
        (base as f64 * factor).round() as u64
    } else {
        base
    };

    Duration::from_millis(millis)
}

/// Execute an operation with retry and backoff
///
/// Every failed call appends a [`RetryAttempt`]; the operation is abandoned
/// once the error is non-retryable or `max_retries` retries are spent
/// (`max_retries + 1` total calls).
pub async fn execute_with_retry<T, F, Fut>(
    config: &RetryConfig,
    clock: &Arc<dyn Clock>,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AuditError>>,
{
    let mut attempts = Vec::new();
    let mut delay_before = Duration::ZERO;

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(error) => {
                let attempt_no = attempts.len() as u32 + 1;
                attempts.push(RetryAttempt {
                    attempt: attempt_no,
                    error: error.to_string(),
                    kind: error.kind(),
                    delay_since_ms: delay_before.as_millis() as u64,
                    timestamp: clock.now_iso(),
                });

                let retries_spent = attempts.len() as u32 - 1;
                if !config.is_retryable(&error) || retries_spent >= config.max_retries {
                    tracing::debug!(
                        kind = %error.kind(),
                        attempts = attempts.len(),
                        "Retry abandoned"
                    );
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                    };
                }

                delay_before = calculate_delay(attempt_no, config);
                tracing::trace!(
                    attempt = attempt_no,
                    delay_ms = delay_before.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::time::sleep(delay_before).await;
            }
        }
    }
}
