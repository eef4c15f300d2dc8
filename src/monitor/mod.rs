//! Monitoring service — streaming pattern detection over audit events
//!
//! Consumes the processor's success path (or a parallel tap), runs every
//! pattern detector against rolling windows, and fans resulting alerts out
//! to the registered [`AlertHandler`]s. Detector state sits behind a single
//! async mutex, which serializes window updates and preserves
//! per-principal ordering even when events arrive from concurrent workers.

pub mod alert;
pub mod patterns;

use crate::clock::Clock;
use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use alert::{Alert, AlertHandler, AlertSeverity, AlertType};
use patterns::{Detectors, PatternDetectionConfig, PatternMatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Read-only snapshot of monitoring counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringMetrics {
    pub events_processed: u64,
    pub alerts_emitted: u64,
    pub active_alerts: usize,
    pub tracked_windows: usize,
}

/// Monitoring health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringHealth {
    pub healthy: bool,
    pub active_critical_alerts: usize,
    pub registered_handlers: usize,
}

/// Streaming pattern detection with pluggable alert delivery
pub struct MonitoringService {
    clock: Arc<dyn Clock>,
    detectors: Mutex<Detectors>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    /// Active (unresolved) alerts by id
    active: RwLock<HashMap<String, Alert>>,
    events_processed: AtomicU64,
    alerts_emitted: AtomicU64,
}

impl MonitoringService {
    /// Create a service with the given detector thresholds
    pub fn new(config: PatternDetectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            detectors: Mutex::new(Detectors::new(config)),
            handlers: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            events_processed: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
        }
    }

    /// Service with default thresholds on the system clock
    pub fn with_defaults() -> Self {
        Self::new(
            PatternDetectionConfig::default(),
            Arc::new(crate::clock::SystemClock),
        )
    }

    /// Register an alert handler
    pub async fn register_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Feed one successfully-persisted event through every detector
    ///
    /// Threshold breaches construct alerts, fan them out, and index them as
    /// active. Handler failures are logged and never block other handlers.
    pub async fn process_event(&self, event: &AuditEvent) -> Result<()> {
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        let matches = {
            let mut detectors = self.detectors.lock().await;
            detectors.evaluate(event, self.clock.now_millis())
        };

        for pattern_match in matches {
            let alert = self.build_alert(event, &pattern_match);
            self.emit(alert).await;
        }
        Ok(())
    }

    /// Raise an alert directly, bypassing the detectors
    ///
    /// Used by operational signals such as the dead-letter backlog alert.
    pub async fn raise_alert(&self, alert: Alert) {
        self.emit(alert).await;
    }

    /// Resolve an active alert and propagate the resolution to handlers
    pub async fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<()> {
        let mut alert = {
            let mut active = self.active.write().await;
            active.remove(alert_id).ok_or_else(|| {
                AuditError::NotFound(format!("active alert '{}'", alert_id))
            })?
        };
        alert.resolved = true;
        alert.resolved_at = Some(self.clock.now_iso());
        alert.resolved_by = Some(resolved_by.to_string());

        tracing::info!(
            alert_id = %alert_id,
            resolved_by = %resolved_by,
            "Alert resolved"
        );

        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if let Err(e) = handler.resolve_alert(alert_id, resolved_by).await {
                tracing::warn!(
                    alert_id = %alert_id,
                    error = %e,
                    "Alert handler failed to record resolution"
                );
            }
        }
        Ok(())
    }

    /// Unresolved alerts, optionally filtered by organization
    pub async fn active_alerts(&self, organization_id: Option<&str>) -> Vec<Alert> {
        let active = self.active.read().await;
        active
            .values()
            .filter(|a| match organization_id {
                Some(org) => a.metadata.get("organizationId").map(String::as_str) == Some(org),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Counter snapshot
    pub async fn metrics(&self) -> MonitoringMetrics {
        MonitoringMetrics {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            active_alerts: self.active.read().await.len(),
            tracked_windows: self.detectors.lock().await.tracked_windows(),
        }
    }

    /// Health snapshot: unhealthy while critical alerts are active
    pub async fn health_status(&self) -> MonitoringHealth {
        let active = self.active.read().await;
        let critical = active
            .values()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .count();
        MonitoringHealth {
            healthy: critical == 0,
            active_critical_alerts: critical,
            registered_handlers: self.handlers.read().await.len(),
        }
    }

    fn build_alert(&self, event: &AuditEvent, pattern_match: &PatternMatch) -> Alert {
        let mut alert = Alert::new(
            pattern_match.severity,
            AlertType::Security,
            pattern_match.title.clone(),
            pattern_match.description.clone(),
            self.clock.now_iso(),
            "monitoring-service",
        )
        .with_metadata("patternType", pattern_match.pattern.as_str())
        .with_metadata("scope", pattern_match.scope.clone())
        .with_metadata(
            "contributingEvents",
            pattern_match.contributing_events.to_string(),
        );

        if let Some(org) = &event.organization_id {
            alert = alert.with_metadata("organizationId", org.clone());
        }
        if let Some(correlation_id) = &event.correlation_id {
            alert = alert.with_correlation(correlation_id.clone());
        }
        alert
    }

    async fn emit(&self, alert: Alert) {
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            alert_id = %alert.id,
            severity = ?alert.severity,
            pattern = alert.metadata.get("patternType").map(String::as_str).unwrap_or("-"),
            title = %alert.title,
            "Alert raised"
        );

        {
            let mut active = self.active.write().await;
            active.insert(alert.id.clone(), alert.clone());
        }

        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if let Err(e) = handler.send_alert(&alert).await {
                tracing::warn!(
                    alert_id = %alert.id,
                    error = %e,
                    "Alert handler failed, continuing fan-out"
                );
            }
        }
    }
}
