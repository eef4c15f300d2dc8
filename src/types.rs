//! Core audit event types
//!
//! All types use camelCase JSON serialization for wire compatibility with
//! the platform's REST surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Action was attempted, outcome not yet known
    Attempt,
    /// Action completed successfully
    Success,
    /// Action failed
    Failure,
}

/// Sensitivity of the data touched by the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    /// Protected health information — the strictest tier
    Phi,
}

/// Session attribution captured at the platform boundary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// A single audit event — the unit of work for the pipeline
///
/// Events follow the dot-separated action convention
/// (`auth.login.failure`, `fhir.patient.read`). Producers create events
/// without integrity fields; the pipeline attaches `hash`/`hash_algorithm`
/// once during persistence, after which the signed fields are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Event identifier (evt-<uuid>), assigned at creation
    pub id: String,

    /// ISO-8601 timestamp of the audited action
    pub timestamp: String,

    /// Dotted action namespace (e.g., `auth.login.failure`)
    pub action: String,

    /// Outcome of the action
    pub status: EventStatus,

    /// Acting principal (user, service account)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,

    /// Tenant the action occurred in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    /// Type of the resource acted on (e.g., "Patient")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resource_type: Option<String>,

    /// Identifier of the resource acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resource_id: Option<String>,

    /// Sensitivity tier of the data touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<DataClassification>,

    /// Session attribution (session id, ip, user agent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_context: Option<SessionContext>,

    /// Correlation id linking related events across services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Arbitrary structured detail map
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,

    /// Integrity hash (lowercase hex), attached by the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Algorithm used for the integrity hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
}

impl AuditEvent {
    /// Create a new event with an auto-generated id
    pub fn new(
        timestamp: impl Into<String>,
        action: impl Into<String>,
        status: EventStatus,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            timestamp: timestamp.into(),
            action: action.into(),
            status,
            principal_id: None,
            organization_id: None,
            target_resource_type: None,
            target_resource_id: None,
            data_classification: None,
            session_context: None,
            correlation_id: None,
            details: HashMap::new(),
            hash: None,
            hash_algorithm: None,
        }
    }

    /// Set the acting principal
    pub fn with_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    /// Set the tenant
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    /// Set the target resource
    pub fn with_target(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.target_resource_type = Some(resource_type.into());
        self.target_resource_id = Some(resource_id.into());
        self
    }

    /// Set the data classification tier
    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.data_classification = Some(classification);
        self
    }

    /// Set the session context
    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session_context = Some(session);
        self
    }

    /// Set the correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Whether the integrity hash has been attached
    pub fn is_sealed(&self) -> bool {
        self.hash.is_some()
    }

    /// Minimal structural validation before the event enters the queue
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.timestamp.is_empty() {
            return Err(crate::error::AuditError::Validation(
                "timestamp must not be empty".to_string(),
            ));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(crate::error::AuditError::Validation(format!(
                "timestamp '{}' is not valid ISO-8601",
                self.timestamp
            )));
        }
        if self.action.is_empty() {
            return Err(crate::error::AuditError::Validation(
                "action must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
