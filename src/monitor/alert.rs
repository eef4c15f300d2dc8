//! Alert types and the pluggable alert-delivery contract
//!
//! The monitoring service fans out every alert to all registered
//! [`AlertHandler`]s; individual handler failures are logged and never
//! block the others.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Alert severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Security,
    Compliance,
    Performance,
    System,
}

/// A security/operational alert raised by the monitoring service
///
/// Mutated only by resolution; never deleted by the monitoring core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Alert identifier (alr-<uuid>)
    pub id: String,

    pub severity: AlertSeverity,

    #[serde(rename = "type")]
    pub alert_type: AlertType,

    pub title: String,

    pub description: String,

    /// ISO-8601 timestamp when the alert was raised
    pub timestamp: String,

    /// Component that raised the alert
    pub source: String,

    /// Structured context: organizationId, patternType, event counts
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub resolved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Alert {
    /// Create an unresolved alert with a generated id
    pub fn new(
        severity: AlertSeverity,
        alert_type: AlertType,
        title: impl Into<String>,
        description: impl Into<String>,
        timestamp: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("alr-{}", uuid::Uuid::new_v4()),
            severity,
            alert_type,
            title: title.into(),
            description: description.into(),
            timestamp: timestamp.into(),
            source: source.into(),
            metadata: HashMap::new(),
            correlation_id: None,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Pluggable alert sink
///
/// Implementations deliver alerts somewhere observable (console, database,
/// pager) and own their persistence/cleanup.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Deliver a newly-raised alert
    async fn send_alert(&self, alert: &Alert) -> Result<()>;

    /// Record that an alert was resolved
    async fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<()>;

    /// Unresolved alerts known to this handler, optionally per organization
    async fn active_alerts(&self, organization_id: Option<&str>) -> Result<Vec<Alert>>;
}

/// Alert handler that logs through `tracing`
///
/// The minimal observable sink; severity maps to log level.
#[derive(Debug, Default)]
pub struct ConsoleAlertHandler;

#[async_trait]
impl AlertHandler for ConsoleAlertHandler {
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => tracing::error!(
                alert_id = %alert.id,
                severity = ?alert.severity,
                title = %alert.title,
                description = %alert.description,
                "Security alert"
            ),
            AlertSeverity::Medium => tracing::warn!(
                alert_id = %alert.id,
                title = %alert.title,
                description = %alert.description,
                "Security alert"
            ),
            AlertSeverity::Low => tracing::info!(
                alert_id = %alert.id,
                title = %alert.title,
                description = %alert.description,
                "Security alert"
            ),
        }
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<()> {
        tracing::info!(alert_id = %alert_id, resolved_by = %resolved_by, "Alert resolved");
        Ok(())
    }

    async fn active_alerts(&self, _organization_id: Option<&str>) -> Result<Vec<Alert>> {
        // Console output is write-only
        Ok(Vec::new())
    }
}

/// In-memory alert handler for tests
///
/// Retains every alert it receives and applies resolutions in place.
#[derive(Default)]
pub struct MemoryAlertHandler {
    alerts: RwLock<Vec<Alert>>,
    resolutions: RwLock<Vec<(String, String)>>,
}

impl MemoryAlertHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All alerts ever received, in arrival order
    pub async fn received(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    /// (alert_id, resolved_by) pairs in resolution order
    pub async fn resolutions(&self) -> Vec<(String, String)> {
        self.resolutions.read().await.clone()
    }
}

#[async_trait]
impl AlertHandler for MemoryAlertHandler {
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<()> {
        let mut alerts = self.alerts.write().await;
        for alert in alerts.iter_mut().filter(|a| a.id == alert_id) {
            alert.resolved = true;
            alert.resolved_by = Some(resolved_by.to_string());
        }
        self.resolutions
            .write()
            .await
            .push((alert_id.to_string(), resolved_by.to_string()));
        Ok(())
    }

    async fn active_alerts(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|a| !a.resolved)
            .filter(|a| match organization_id {
                Some(org) => a.metadata.get("organizationId").map(String::as_str) == Some(org),
                None => true,
            })
            .cloned()
            .collect())
    }
}
