//! Dead-letter handling — the last line of defense
//!
//! Events that exhaust retries are recorded here with full failure context
//! so nothing is silently dropped. The handler appends to a pluggable
//! [`DeadLetterStore`], tracks aggregate statistics, fires registered
//! alert callbacks when the backlog crosses the configured threshold, and
//! sweeps entries past retention. A dead-letter failure never re-enters
//! the processor's retry path.

use crate::clock::Clock;
use crate::error::{AuditError, Result};
use crate::retry::RetryAttempt;
use crate::types::AuditEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A permanently-failed event with the context of its failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// The event as it was when processing gave up
    pub original_event: AuditEvent,

    /// Final error that exhausted processing
    pub failure_reason: String,

    /// Number of failed calls (attempt history length)
    pub failure_count: u32,

    /// ISO-8601 timestamp of the first failed call
    pub first_failure_time: String,

    /// ISO-8601 timestamp of the last failed call
    pub last_failure_time: String,

    /// Queue the event was consumed from
    pub original_queue: String,

    /// Full per-call failure history
    pub attempt_history: Vec<RetryAttempt>,
}

/// Aggregate statistics over the dead-letter store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    /// Entries currently retained
    pub total_events: u64,

    /// ISO-8601 timestamp of the oldest retained entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_event: Option<String>,
}

/// Pluggable durable store for dead-lettered events
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append an entry; must be durable before returning
    async fn append(&self, entry: DeadLetterEntry) -> Result<()>;

    /// Number of retained entries
    async fn count(&self) -> Result<u64>;

    /// Most recent entries, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// ISO-8601 timestamp of the oldest retained entry
    async fn oldest(&self) -> Result<Option<String>>;

    /// Remove entries dead-lettered before the cutoff, returning the count
    async fn purge_before(&self, cutoff_millis: u64) -> Result<u64>;
}

/// In-memory [`DeadLetterStore`] for tests and single-process use
pub struct MemoryDeadLetterStore {
    clock: Arc<dyn Clock>,
    /// (dead_lettered_at millis, entry), oldest first
    entries: RwLock<Vec<(u64, DeadLetterEntry)>>,
    max_entries: usize,
}

impl MemoryDeadLetterStore {
    /// Create a store bounded at `max_entries` (oldest drained first)
    pub fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            clock,
            entries: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    /// Store bounded at 10k entries on the system clock
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(crate::clock::SystemClock), 10_000)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push((self.clock.now_millis(), entry));

        if self.max_entries > 0 && entries.len() > self.max_entries {
            let drain_count = entries.len() - self.max_entries;
            entries.drain(..drain_count);
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.entries.read().await.len() as u64)
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn oldest(&self) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .first()
            .map(|(_, e)| e.last_failure_time.clone()))
    }

    async fn purge_before(&self, cutoff_millis: u64) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(at, _)| *at >= cutoff_millis);
        Ok((before - entries.len()) as u64)
    }
}

/// Callback invoked when the dead-letter backlog crosses the threshold
pub type DlqAlertFn = Arc<dyn Fn(DeadLetterStats) + Send + Sync>;

/// Dead-letter policy
#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Name of the dead-letter queue/store
    pub queue_name: String,

    /// Backlog size at which alert callbacks fire
    pub alert_threshold: u64,

    /// Entries older than this are purged by the retention sweep
    pub max_retention_days: u32,

    /// Interval between retention sweeps
    pub processing_interval: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            queue_name: "audit-events-dlq".to_string(),
            alert_threshold: 100,
            max_retention_days: 30,
            processing_interval: Duration::from_secs(3_600),
        }
    }
}

/// Records permanently-failed events and raises backlog alerts
pub struct DeadLetterHandler {
    config: DeadLetterConfig,
    store: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    callbacks: RwLock<Vec<DlqAlertFn>>,
    /// Latch for crossing-based alerting: set while at/above threshold
    above_threshold: AtomicBool,
}

impl DeadLetterHandler {
    /// Create a handler over the given store
    pub fn new(
        config: DeadLetterConfig,
        store: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            callbacks: RwLock::new(Vec::new()),
            above_threshold: AtomicBool::new(false),
        }
    }

    /// The configured dead-letter queue name
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Register a callback for threshold-crossing alerts
    pub async fn on_threshold_alert(&self, callback: DlqAlertFn) {
        self.callbacks.write().await.push(callback);
    }

    /// Record an event that exhausted processing
    ///
    /// Appends a [`DeadLetterEntry`] built from the attempt history, then
    /// fires alert callbacks if this insert crossed `alert_threshold`
    /// (crossing-based, not level-based: the latch re-arms only after the
    /// backlog drops below threshold, so sustained overload yields one
    /// alert per excursion rather than one per insert).
    pub async fn add_failed_event(
        &self,
        event: AuditEvent,
        error: &AuditError,
        origin_queue: &str,
        attempt_history: Vec<RetryAttempt>,
    ) -> Result<()> {
        let now_iso = self.clock.now_iso();
        let first_failure_time = attempt_history
            .first()
            .map(|a| a.timestamp.clone())
            .unwrap_or_else(|| now_iso.clone());
        let last_failure_time = attempt_history
            .last()
            .map(|a| a.timestamp.clone())
            .unwrap_or(now_iso);

        let entry = DeadLetterEntry {
            failure_reason: error.to_string(),
            failure_count: attempt_history.len() as u32,
            first_failure_time,
            last_failure_time,
            original_queue: origin_queue.to_string(),
            attempt_history,
            original_event: event,
        };

        tracing::warn!(
            event_id = %entry.original_event.id,
            action = %entry.original_event.action,
            queue = %self.config.queue_name,
            failure_count = entry.failure_count,
            reason = %entry.failure_reason,
            "Event dead-lettered"
        );

        self.store
            .append(entry)
            .await
            .map_err(|e| AuditError::DeadLetter(e.to_string()))?;

        let stats = self.statistics().await?;
        if stats.total_events >= self.config.alert_threshold {
            let crossed = !self.above_threshold.swap(true, Ordering::SeqCst);
            if crossed {
                tracing::error!(
                    queue = %self.config.queue_name,
                    total_events = stats.total_events,
                    threshold = self.config.alert_threshold,
                    "Dead-letter backlog crossed alert threshold"
                );
                let callbacks = self.callbacks.read().await;
                for callback in callbacks.iter() {
                    callback(stats.clone());
                }
            }
        } else {
            self.above_threshold.store(false, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Current aggregate statistics
    pub async fn statistics(&self) -> Result<DeadLetterStats> {
        Ok(DeadLetterStats {
            total_events: self.store.count().await?,
            oldest_event: self.store.oldest().await?,
        })
    }

    /// Most recent entries, newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.store.list(limit).await
    }

    /// Purge entries older than `max_retention_days`, re-arming the alert
    /// latch if the backlog dropped below threshold
    pub async fn run_retention_sweep(&self) -> Result<u64> {
        let retention_ms = self.config.max_retention_days as u64 * 24 * 3_600 * 1_000;
        let cutoff = self.clock.now_millis().saturating_sub(retention_ms);
        let purged = self.store.purge_before(cutoff).await?;

        if purged > 0 {
            tracing::info!(
                queue = %self.config.queue_name,
                purged,
                "Retention sweep purged dead-letter entries"
            );
            if self.store.count().await? < self.config.alert_threshold {
                self.above_threshold.store(false, Ordering::SeqCst);
            }
        }
        Ok(purged)
    }

    /// Run retention sweeps every `processing_interval` until `shutdown`
    /// flips to true
    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(handler.config.processing_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = handler.run_retention_sweep().await {
                            tracing::warn!(error = %e, "Retention sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
