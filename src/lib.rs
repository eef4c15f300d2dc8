//! # audit-pipeline
//!
//! Tamper-evident audit event processing for healthcare compliance workloads.
//!
//! ## Overview
//!
//! `audit-pipeline` takes audit events from submission to durable, sealed
//! storage. Events flow through a durable queue into a worker pool that
//! attaches a cryptographic integrity hash, writes through a retry layer and
//! circuit breaker, and dead-letters anything that exhausts processing. A
//! monitoring service watches the stored stream for suspicious access
//! patterns and fans alerts out to pluggable handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audit_pipeline::{
//!     AuditEvent, DeadLetterConfig, DeadLetterHandler, EventStatus,
//!     MemoryDeadLetterStore, MemoryQueue, ProcessorConfig, ReliableEventProcessor,
//! };
//! use audit_pipeline::clock::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> audit_pipeline::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let queue = Arc::new(MemoryQueue::with_defaults());
//! let store = Arc::new(MemoryDeadLetterStore::new(clock.clone(), 10_000));
//! let dlq = Arc::new(DeadLetterHandler::new(
//!     DeadLetterConfig::default(),
//!     store,
//!     clock,
//! ));
//!
//! let processor = Arc::new(ReliableEventProcessor::new(
//!     ProcessorConfig::default(),
//!     queue,
//!     dlq,
//!     Arc::new(|event| Box::pin(async move {
//!         // write `event` to the audit store
//!         let _ = event;
//!         Ok(())
//!     })),
//! ));
//!
//! processor.start().await?;
//! processor
//!     .add_event(AuditEvent::new(
//!         "2026-03-01T10:15:00Z",
//!         "auth.login.success",
//!         EventStatus::Success,
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **DurableQueue** trait — at-least-once delivery with ack/nack leases
//! - **ReliableEventProcessor** — worker pool with retry, breaker, DLQ
//! - **integrity** — canonical-JSON SHA-256 sealing and verification
//! - **MonitoringService** — sliding-window pattern detection and alerting
//! - **AlertHandler** trait — pluggable alert sinks

pub mod breaker;
pub mod clock;
pub mod dlq;
pub mod error;
pub mod integrity;
pub mod monitor;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod types;

// Re-export core types
pub use breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState, StateChange};
pub use dlq::{
    DeadLetterConfig, DeadLetterEntry, DeadLetterHandler, DeadLetterStats, DeadLetterStore,
    MemoryDeadLetterStore,
};
pub use error::{AuditError, ErrorKind, Result};
pub use monitor::alert::{
    Alert, AlertHandler, AlertSeverity, AlertType, ConsoleAlertHandler, MemoryAlertHandler,
};
pub use monitor::patterns::{PatternDetectionConfig, PatternMatch, PatternType};
pub use monitor::{MonitoringHealth, MonitoringMetrics, MonitoringService};
pub use processor::{
    PersistFn, ProcessorConfig, ProcessorHealth, ProcessorStats, ReliableEventProcessor,
};
pub use queue::{AckToken, Delivery, DurableQueue, MemoryQueue};
pub use retry::{BackoffStrategy, RetryAttempt, RetryConfig, RetryOutcome};
pub use types::{AuditEvent, DataClassification, EventStatus, SessionContext};
