//! Pattern detectors over the audit event stream
//!
//! Each detector keeps its own sliding window of qualifying event
//! timestamps, keyed by principal (or organization-wide for bulk
//! detection). Windows evict lazily as events age out, and a window is
//! cleared when its detector fires so one breach emits exactly one match.

use crate::monitor::alert::AlertSeverity;
use crate::types::{AuditEvent, EventStatus};
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// The behavioral patterns the monitoring service scans for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    FailedAuth,
    UnauthorizedAccess,
    DataVelocity,
    OffHours,
    BulkOperation,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::FailedAuth => "FAILED_AUTH",
            PatternType::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            PatternType::DataVelocity => "DATA_VELOCITY",
            PatternType::OffHours => "OFF_HOURS",
            PatternType::BulkOperation => "BULK_OPERATION",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-detector thresholds and windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDetectionConfig {
    /// Failed logins per principal before FAILED_AUTH fires
    pub failed_auth_threshold: u32,
    pub failed_auth_window_ms: u64,

    /// Access-denied failures per principal before UNAUTHORIZED_ACCESS fires
    pub unauthorized_threshold: u32,
    pub unauthorized_window_ms: u64,

    /// Successful data reads per principal before DATA_VELOCITY fires
    pub data_velocity_threshold: u32,
    pub data_velocity_window_ms: u64,

    /// Export/bulk events org-wide before BULK_OPERATION fires
    pub bulk_operation_threshold: u32,
    pub bulk_operation_window_ms: u64,

    /// Local hours treated as business hours: [start, end)
    pub business_hours_start: u32,
    pub business_hours_end: u32,
}

impl Default for PatternDetectionConfig {
    fn default() -> Self {
        Self {
            failed_auth_threshold: 5,
            failed_auth_window_ms: 10 * 60_000,
            unauthorized_threshold: 4,
            unauthorized_window_ms: 10 * 60_000,
            data_velocity_threshold: 50,
            data_velocity_window_ms: 5 * 60_000,
            bulk_operation_threshold: 100,
            bulk_operation_window_ms: 15 * 60_000,
            business_hours_start: 6,
            business_hours_end: 22,
        }
    }
}

/// A detector firing: everything needed to construct an alert
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: PatternType,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    /// Principal or organization the window was keyed by
    pub scope: String,
    /// Qualifying events that contributed to the breach
    pub contributing_events: u32,
}

/// Window identity: who is being watched, for which pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    scope: String,
    pattern: PatternType,
}

/// Time-ordered deque of qualifying-event timestamps
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<u64>,
}

impl SlidingWindow {
    fn observe(&mut self, now: u64, window_ms: u64) -> u32 {
        let cutoff = now.saturating_sub(window_ms);
        while matches!(self.timestamps.front(), Some(at) if *at < cutoff) {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
        self.timestamps.len() as u32
    }
}

/// All detector state: one window per `(scope, pattern)` pair
///
/// Not internally synchronized — the monitoring service guards it with a
/// single lock, which also serializes per-principal window updates.
pub struct Detectors {
    config: PatternDetectionConfig,
    windows: HashMap<WindowKey, SlidingWindow>,
}

impl Detectors {
    pub fn new(config: PatternDetectionConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Number of windows currently tracked
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    /// Evaluate one event against every detector
    ///
    /// `now_ms` drives the sliding windows; off-hours uses the event's own
    /// local timestamp.
    pub fn evaluate(&mut self, event: &AuditEvent, now_ms: u64) -> Vec<PatternMatch> {
        let mut matches = Vec::new();
        let local_hour = local_hour(event);
        let in_business_hours = local_hour
            .map(|h| self.is_business_hour(h))
            .unwrap_or(true);

        if is_failed_auth(event) {
            if let Some(principal) = event.principal_id.as_deref() {
                if let Some(count) = self.bump(
                    principal,
                    PatternType::FailedAuth,
                    now_ms,
                    self.config.failed_auth_window_ms,
                    self.config.failed_auth_threshold,
                ) {
                    matches.push(PatternMatch {
                        pattern: PatternType::FailedAuth,
                        severity: AlertSeverity::High,
                        title: "Repeated failed authentication".to_string(),
                        description: format!(
                            "{} failed login attempts for principal '{}' within the monitoring window",
                            count, principal
                        ),
                        scope: principal.to_string(),
                        contributing_events: count,
                    });
                }
            }
        }

        if is_access_denied(event) {
            if let Some(principal) = event.principal_id.as_deref() {
                if let Some(count) = self.bump(
                    principal,
                    PatternType::UnauthorizedAccess,
                    now_ms,
                    self.config.unauthorized_window_ms,
                    self.config.unauthorized_threshold,
                ) {
                    matches.push(PatternMatch {
                        pattern: PatternType::UnauthorizedAccess,
                        severity: AlertSeverity::Critical,
                        title: "Repeated unauthorized access attempts".to_string(),
                        description: format!(
                            "{} access-denied events for principal '{}' within the monitoring window",
                            count, principal
                        ),
                        scope: principal.to_string(),
                        contributing_events: count,
                    });
                }
            }
        }

        if in_business_hours && is_data_read(event) {
            if let Some(principal) = event.principal_id.as_deref() {
                if let Some(count) = self.bump(
                    principal,
                    PatternType::DataVelocity,
                    now_ms,
                    self.config.data_velocity_window_ms,
                    self.config.data_velocity_threshold,
                ) {
                    matches.push(PatternMatch {
                        pattern: PatternType::DataVelocity,
                        severity: AlertSeverity::Medium,
                        title: "High-velocity data access".to_string(),
                        description: format!(
                            "{} record reads by principal '{}' in a short window",
                            count, principal
                        ),
                        scope: principal.to_string(),
                        contributing_events: count,
                    });
                }
            }
        }

        if let Some(hour) = local_hour {
            if !self.is_business_hour(hour) {
                // Single-event trigger, no windowing
                matches.push(PatternMatch {
                    pattern: PatternType::OffHours,
                    severity: AlertSeverity::Low,
                    title: "Off-hours access".to_string(),
                    description: format!(
                        "'{}' at {:02}:00 local, outside business hours {:02}:00-{:02}:00",
                        event.action,
                        hour,
                        self.config.business_hours_start,
                        self.config.business_hours_end
                    ),
                    scope: event
                        .principal_id
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    contributing_events: 1,
                });
            }
        }

        if in_business_hours && is_bulk_operation(event) {
            let scope = event
                .organization_id
                .clone()
                .unwrap_or_else(|| "global".to_string());
            if let Some(count) = self.bump(
                &scope,
                PatternType::BulkOperation,
                now_ms,
                self.config.bulk_operation_window_ms,
                self.config.bulk_operation_threshold,
            ) {
                matches.push(PatternMatch {
                    pattern: PatternType::BulkOperation,
                    severity: AlertSeverity::Medium,
                    title: "Elevated bulk operation volume".to_string(),
                    description: format!(
                        "{} export/bulk events for organization '{}' within the monitoring window",
                        count, scope
                    ),
                    scope,
                    contributing_events: count,
                });
            }
        }

        matches
    }

    /// Record a qualifying event; returns the window count when it breaches
    /// the threshold, clearing the window so the breach fires exactly once.
    fn bump(
        &mut self,
        scope: &str,
        pattern: PatternType,
        now_ms: u64,
        window_ms: u64,
        threshold: u32,
    ) -> Option<u32> {
        let key = WindowKey {
            scope: scope.to_string(),
            pattern,
        };
        let window = self.windows.entry(key.clone()).or_default();
        let count = window.observe(now_ms, window_ms);
        if count >= threshold {
            self.windows.remove(&key);
            Some(count)
        } else {
            None
        }
    }

    fn is_business_hour(&self, hour: u32) -> bool {
        hour >= self.config.business_hours_start && hour < self.config.business_hours_end
    }
}

fn is_failed_auth(event: &AuditEvent) -> bool {
    event.action == "auth.login.failure"
        || (event.action.starts_with("auth.login") && event.status == EventStatus::Failure)
}

fn is_access_denied(event: &AuditEvent) -> bool {
    event.status == EventStatus::Failure
        && (event.action.ends_with(".denied")
            || event.action.contains("unauthorized")
            || event
                .details
                .get("outcome")
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.eq_ignore_ascii_case("access_denied")))
}

fn is_data_read(event: &AuditEvent) -> bool {
    event.status == EventStatus::Success
        && event.action.ends_with(".read")
        && (event.action.starts_with("fhir.") || event.action.starts_with("data."))
}

fn is_bulk_operation(event: &AuditEvent) -> bool {
    event.action.contains("export") || event.action.starts_with("bulk.")
}

/// Hour of day in the event's own local timestamp, if parseable
fn local_hour(event: &AuditEvent) -> Option<u32> {
    chrono::DateTime::parse_from_rfc3339(&event.timestamp)
        .ok()
        .map(|dt| dt.hour())
}
