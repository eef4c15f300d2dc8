//! Circuit breaker protecting the downstream store
//!
//! Three-state machine (CLOSED/OPEN/HALF_OPEN) shared by all workers that
//! dispatch to one resource. Opening policy: `failure_threshold` failures
//! within `monitoring_period`, provided the window saw at least
//! `minimum_throughput` requests. While open, calls fail fast with
//! [`AuditError::CircuitOpen`] without touching the wrapped operation and
//! without counting toward failure statistics.
//!
//! All counters live behind one mutex; callers only observe method-level
//! atomicity, never partial reads of failures vs. totals.

use crate::clock::Clock;
use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing fast, requests rejected immediately
    Open,
    /// Testing recovery, probe requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning for one protected resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window required to open
    pub failure_threshold: u32,

    /// Minimum requests in the window before the breaker may open
    pub minimum_throughput: u32,

    /// How long to stay open before probing, in milliseconds
    pub recovery_timeout_ms: u64,

    /// Rolling window for failure counting, in milliseconds
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_throughput: 5,
            recovery_timeout_ms: 30_000,
            monitoring_period_ms: 60_000,
        }
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Unix milliseconds of the transition
    pub at: u64,
    pub reason: String,
}

/// Read-only snapshot of breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerMetrics {
    pub state: CircuitState,
    /// Requests observed within the current monitoring window
    pub total_requests: u64,
    /// Failures observed within the current monitoring window
    pub failures: u64,
    /// failures / total_requests (0.0 when the window is empty)
    pub failure_rate: f64,
    pub state_changes: Vec<StateChange>,
}

struct Inner {
    state: CircuitState,
    /// (timestamp_ms, is_failure) per request, trimmed to the window
    outcomes: VecDeque<(u64, bool)>,
    /// When the breaker last entered OPEN
    opened_at: u64,
    state_changes: Vec<StateChange>,
}

/// Shared failure-tracking state machine, one instance per protected
/// resource. Clone-cheap via `Arc`.
pub struct CircuitBreaker {
    resource: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named resource
    pub fn new(
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resource: resource.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: 0,
                state_changes: Vec::new(),
            }),
        }
    }

    /// The resource this breaker protects
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Execute an operation under breaker protection
    ///
    /// Fails fast with [`AuditError::CircuitOpen`] while open; otherwise
    /// runs the operation and records its outcome.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.preflight()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Check whether a call is currently permitted
    ///
    /// Transitions OPEN→HALF_OPEN once the recovery timeout has elapsed.
    /// Returns [`AuditError::CircuitOpen`] with the remaining cooldown when
    /// the call must be rejected. Exposed so callers that need to carry
    /// extra failure context (the processor's attempt history) can bracket
    /// the operation themselves with `record_success`/`record_failure`.
    pub fn preflight(&self) -> Result<()> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(inner.opened_at);
                if elapsed >= self.config.recovery_timeout_ms {
                    self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout elapsed");
                    Ok(())
                } else {
                    Err(AuditError::CircuitOpen {
                        resource: self.resource.clone(),
                        retry_after_ms: self.config.recovery_timeout_ms - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.outcomes.push_back((now, false));
                Self::trim_window(&mut inner, now, self.config.monitoring_period_ms);
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Closed, "probe succeeded");
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                inner.outcomes.push_back((now, true));
                Self::trim_window(&mut inner, now, self.config.monitoring_period_ms);

                let total = inner.outcomes.len() as u32;
                let failures = inner.outcomes.iter().filter(|(_, f)| *f).count() as u32;
                if failures >= self.config.failure_threshold
                    && total >= self.config.minimum_throughput
                {
                    inner.opened_at = now;
                    self.transition(
                        &mut inner,
                        CircuitState::Open,
                        &format!("{} failures within monitoring window", failures),
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = now;
                self.transition(&mut inner, CircuitState::Open, "probe failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, applying any due OPEN→HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open
            && now.saturating_sub(inner.opened_at) >= self.config.recovery_timeout_ms
        {
            self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout elapsed");
        }
        inner.state
    }

    /// Snapshot of current statistics
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let total = inner.outcomes.len() as u64;
        let failures = inner.outcomes.iter().filter(|(_, f)| *f).count() as u64;
        BreakerMetrics {
            state: inner.state,
            total_requests: total,
            failures,
            failure_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
            state_changes: inner.state_changes.clone(),
        }
    }

    fn trim_window(inner: &mut Inner, now: u64, period_ms: u64) {
        let cutoff = now.saturating_sub(period_ms);
        while matches!(inner.outcomes.front(), Some((at, _)) if *at < cutoff) {
            inner.outcomes.pop_front();
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, reason: &str) {
        let from = inner.state;
        inner.state = to;
        inner.state_changes.push(StateChange {
            from,
            to,
            at: self.clock.now_millis(),
            reason: reason.to_string(),
        });

        // Counters reset on entering CLOSED
        if to == CircuitState::Closed {
            inner.outcomes.clear();
        }

        tracing::info!(
            resource = %self.resource,
            from = %from,
            to = %to,
            reason = %reason,
            "Circuit breaker transition"
        );
    }
}
