//! Error types for the audit pipeline
//!
//! Errors carry a typed [`ErrorKind`] produced once at the boundary where
//! the underlying failure originates. Retry and dead-letter decisions match
//! on the kind rather than re-parsing messages throughout the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Durable queue failure (enqueue, dequeue, ack, nack)
    #[error("Queue error on '{queue}': {reason}")]
    Queue { queue: String, reason: String },

    /// Persistence store failure, classified at the store boundary
    #[error("Store error ({kind}): {message}")]
    Store { kind: ErrorKind, message: String },

    /// Fast-fail rejection while the circuit breaker is open
    ///
    /// Distinguishes "resource protected" from "operation failed"; never
    /// retryable by the caller.
    #[error("Circuit breaker open for '{resource}', retry after {retry_after_ms}ms")]
    CircuitOpen {
        resource: String,
        retry_after_ms: u64,
    },

    /// Event failed validation (malformed, missing required fields)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Dead-letter store failure — the last line of defense failed
    #[error("Dead letter error: {0}")]
    DeadLetter(String),

    /// Alert handler failure
    #[error("Alert delivery error: {0}")]
    Alert(String),

    /// Alert or entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditError {
    /// The typed kind of this error, used for retry classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Store { kind, .. } => *kind,
            AuditError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AuditError::Validation(_) => ErrorKind::Validation,
            AuditError::Queue { reason, .. } => ErrorKind::classify(reason),
            _ => ErrorKind::Unknown,
        }
    }

    /// Build a store error, classifying the message once at the boundary
    pub fn store(message: impl Into<String>) -> Self {
        let message = message.into();
        AuditError::Store {
            kind: ErrorKind::classify(&message),
            message,
        }
    }
}

/// Typed error taxonomy for retry classification
///
/// Produced once where the underlying error originates (driver message or
/// error code), then matched by kind everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connection reset or dropped mid-flight (ECONNRESET, broken pipe)
    NetworkReset,
    /// Operation exceeded its deadline (ETIMEDOUT)
    Timeout,
    /// Store-level deadlock, safe to retry
    Deadlock,
    /// Connection pool exhausted or too many connections
    PoolExhausted,
    /// Circuit breaker rejection — never retryable within the pipeline
    CircuitOpen,
    /// Malformed or invalid event — permanent
    Validation,
    /// Anything unrecognized — treated as permanent
    Unknown,
}

impl ErrorKind {
    /// Classify a raw error message or code into a kind
    ///
    /// Case-insensitive substring match on the message, exact match on
    /// well-known driver codes (ECONNRESET, ETIMEDOUT).
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("econnreset")
            || msg.contains("connection reset")
            || msg.contains("broken pipe")
        {
            ErrorKind::NetworkReset
        } else if msg.contains("etimedout") || msg.contains("timeout") || msg.contains("timed out")
        {
            ErrorKind::Timeout
        } else if msg.contains("deadlock") {
            ErrorKind::Deadlock
        } else if msg.contains("pool exhausted")
            || msg.contains("too many connections")
            || msg.contains("too many clients")
        {
            ErrorKind::PoolExhausted
        } else if msg.contains("validation") || msg.contains("invalid") || msg.contains("malformed")
        {
            ErrorKind::Validation
        } else {
            ErrorKind::Unknown
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NetworkReset => "NETWORK_RESET",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Deadlock => "DEADLOCK",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_reset() {
        assert_eq!(ErrorKind::classify("ECONNRESET"), ErrorKind::NetworkReset);
        assert_eq!(
            ErrorKind::classify("connection reset by peer"),
            ErrorKind::NetworkReset
        );
    }

    #[test]
    fn test_classify_timeout() {
        assert_eq!(ErrorKind::classify("ETIMEDOUT"), ErrorKind::Timeout);
        assert_eq!(
            ErrorKind::classify("statement timed out after 30s"),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_classify_deadlock_and_pool() {
        assert_eq!(
            ErrorKind::classify("deadlock detected"),
            ErrorKind::Deadlock
        );
        assert_eq!(
            ErrorKind::classify("FATAL: too many connections"),
            ErrorKind::PoolExhausted
        );
    }

    #[test]
    fn test_classify_validation_and_unknown() {
        assert_eq!(
            ErrorKind::classify("invalid timestamp format"),
            ErrorKind::Validation
        );
        assert_eq!(
            ErrorKind::classify("some novel failure"),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_store_error_carries_kind() {
        let err = AuditError::store("ECONNRESET while writing row");
        assert_eq!(err.kind(), ErrorKind::NetworkReset);
    }

    #[test]
    fn test_circuit_open_kind() {
        let err = AuditError::CircuitOpen {
            resource: "audit-store".to_string(),
            retry_after_ms: 5000,
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.to_string().contains("audit-store"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::NetworkReset.to_string(), "NETWORK_RESET");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "CIRCUIT_OPEN");
    }
}
