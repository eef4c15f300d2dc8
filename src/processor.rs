//! Reliable event processor — queue-backed worker pool
//!
//! Workers pull from the durable input queue, seal each event with its
//! integrity hash, and run the user-supplied persistence operation under
//! retry and circuit-breaker protection. Successful events are acked and
//! fed to the monitoring tap; events that exhaust processing are recorded
//! in the dead-letter handler (with their full attempt history) and acked,
//! since they are then durably held in the DLQ. Delivery is at-least-once:
//! a worker crash leaves the event leased in the queue for redelivery.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::dlq::DeadLetterHandler;
use crate::error::{AuditError, Result};
use crate::integrity;
use crate::monitor::MonitoringService;
use crate::queue::{Delivery, DurableQueue};
use crate::retry::{execute_with_retry, RetryConfig};
use crate::types::AuditEvent;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// The user-supplied persistence operation
///
/// Receives the sealed event (hash attached) and writes it to the store.
/// Errors should be built with [`AuditError::store`] so their kind is
/// classified once at the boundary.
pub type PersistFn = Arc<dyn Fn(AuditEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Processor tuning
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Durable input queue to consume
    pub queue_name: String,

    /// Worker pool size
    pub concurrency: usize,

    /// Idle pause between polls of an empty queue
    pub poll_interval: Duration,

    /// Grace period for in-flight work during `cleanup`
    pub shutdown_grace: Duration,

    /// Retry policy applied around the persistence operation
    pub retry: RetryConfig,

    /// Breaker protecting the persistence store
    pub breaker: CircuitBreakerConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_name: "audit-events".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Processor health snapshot
///
/// The score starts at 100 and degrades with an open breaker, elevated
/// failure rate, dead-letter backlog, and queue depth; it recovers as
/// those normalize (breaker counters reset on close, windows age out).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorHealth {
    /// 0–100, 100 = fully healthy
    pub health_score: u8,
    pub circuit_breaker_state: CircuitState,
    pub queue_depth: usize,
    pub dlq_size: u64,
    pub failure_rate: f64,
}

/// Lifetime counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub processed: u64,
    pub dead_lettered: u64,
}

/// Queue-backed worker pool with retry, circuit breaking, and
/// dead-lettering
pub struct ReliableEventProcessor {
    config: ProcessorConfig,
    queue: Arc<dyn DurableQueue>,
    dlq: Arc<DeadLetterHandler>,
    persist: PersistFn,
    breaker: Arc<CircuitBreaker>,
    monitor: Option<Arc<MonitoringService>>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    processed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl ReliableEventProcessor {
    /// Create a processor on the system clock
    pub fn new(
        config: ProcessorConfig,
        queue: Arc<dyn DurableQueue>,
        dlq: Arc<DeadLetterHandler>,
        persist: PersistFn,
    ) -> Self {
        Self::with_clock(config, queue, dlq, persist, Arc::new(SystemClock))
    }

    /// Create a processor with an injected clock
    pub fn with_clock(
        config: ProcessorConfig,
        queue: Arc<dyn DurableQueue>,
        dlq: Arc<DeadLetterHandler>,
        persist: PersistFn,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "audit-store",
            config.breaker.clone(),
            clock.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queue,
            dlq,
            persist,
            breaker,
            monitor: None,
            clock,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Attach a monitoring tap fed on every successful persistence
    pub fn with_monitor(mut self, monitor: Arc<MonitoringService>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// The breaker protecting the persistence store
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Durably enqueue an event for processing
    ///
    /// Returns only after the queue has accepted the event; queue
    /// unavailability propagates to the caller.
    pub async fn add_event(&self, event: AuditEvent) -> Result<()> {
        event.validate()?;
        self.queue.enqueue(&self.config.queue_name, &event).await
    }

    /// Start the worker pool
    ///
    /// Fails if the queue is unreachable or the pool is already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Queue unavailability is fatal to start, not silently deferred
        self.queue.depth(&self.config.queue_name).await?;

        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(AuditError::Config("processor already started".to_string()));
        }

        for worker_id in 0..self.config.concurrency {
            let processor = self.clone();
            workers.push(tokio::spawn(async move {
                processor.worker_loop(worker_id).await;
            }));
        }

        tracing::info!(
            queue = %self.config.queue_name,
            concurrency = self.config.concurrency,
            "Event processor started"
        );
        Ok(())
    }

    /// Stop dequeuing, wait for in-flight work up to the grace deadline,
    /// abandon anything slower (its events stay leased for redelivery)
    pub async fn cleanup(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return Ok(());
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(handles),
        )
        .await;

        if drained.is_err() {
            tracing::warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Shutdown grace exceeded, abandoning in-flight work"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        tracing::info!(queue = %self.config.queue_name, "Event processor stopped");
        Ok(())
    }

    /// Health snapshot used for liveness/self-healing assertions
    pub async fn health_status(&self) -> Result<ProcessorHealth> {
        let metrics = self.breaker.metrics();
        let state = self.breaker.state();
        let queue_depth = self.queue.depth(&self.config.queue_name).await?;
        let dlq_size = self.dlq.statistics().await?.total_events;

        let mut score: i64 = 100;
        score -= match state {
            CircuitState::Open => 40,
            CircuitState::HalfOpen => 15,
            CircuitState::Closed => 0,
        };
        score -= (metrics.failure_rate * 30.0).round() as i64;
        score -= (dlq_size as i64).min(20);
        if queue_depth > 1_000 {
            score -= 10;
        }

        Ok(ProcessorHealth {
            health_score: score.clamp(0, 100) as u8,
            circuit_breaker_state: state,
            queue_depth,
            dlq_size,
            failure_rate: metrics.failure_rate,
        })
    }

    /// Lifetime processing counters
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tracing::debug!(worker_id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.dequeue(&self.config.queue_name).await {
                Ok(Some(delivery)) => {
                    self.process_delivery(worker_id, delivery).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Dequeue failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn process_delivery(&self, worker_id: usize, delivery: Delivery) {
        let queue_name = &self.config.queue_name;

        // Seal before write; a sealing failure is permanent for the event
        let sealed = match integrity::seal_event(delivery.event.clone()) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(
                    worker_id,
                    event_id = %delivery.event.id,
                    error = %error,
                    "Failed to seal event"
                );
                self.dead_letter(delivery.event.clone(), &error, Vec::new()).await;
                self.ack(&delivery).await;
                return;
            }
        };

        // Fail fast while the store is protected; the event goes back for
        // redelivery and this worker idles out the rejection
        if let Err(rejection) = self.breaker.preflight() {
            tracing::debug!(
                worker_id,
                event_id = %sealed.id,
                error = %rejection,
                "Dispatch rejected by circuit breaker"
            );
            if let Err(e) = self.queue.nack(queue_name, &delivery.token).await {
                tracing::error!(worker_id, error = %e, "Failed to nack rejected event");
            }
            tokio::time::sleep(self.config.poll_interval).await;
            return;
        }

        let persist = self.persist.clone();
        let event_for_op = sealed.clone();
        let outcome = execute_with_retry(&self.config.retry, &self.clock, move || {
            (persist)(event_for_op.clone())
        })
        .await;

        // One breaker request per processing attempt, not per retry call
        match outcome.result {
            Ok(()) => {
                self.breaker.record_success();
                self.ack(&delivery).await;
                self.processed.fetch_add(1, Ordering::Relaxed);

                if let Some(monitor) = &self.monitor {
                    if let Err(e) = monitor.process_event(&sealed).await {
                        tracing::warn!(
                            event_id = %sealed.id,
                            error = %e,
                            "Monitoring tap failed"
                        );
                    }
                }
            }
            Err(error) => {
                self.breaker.record_failure();
                tracing::warn!(
                    worker_id,
                    event_id = %sealed.id,
                    attempts = outcome.attempts.len(),
                    error = %error,
                    "Event exhausted processing, dead-lettering"
                );
                self.dead_letter(sealed, &error, outcome.attempts).await;
                // The event is durably recorded in the DLQ; remove it from
                // the primary queue either way
                self.ack(&delivery).await;
            }
        }
    }

    async fn dead_letter(
        &self,
        event: AuditEvent,
        error: &AuditError,
        attempts: Vec<crate::retry::RetryAttempt>,
    ) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if let Err(dlq_error) = self
            .dlq
            .add_failed_event(event, error, &self.config.queue_name, attempts)
            .await
        {
            // Last line of defense failed: logged, never retried further
            tracing::error!(error = %dlq_error, "Dead-letter store failed");
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self
            .queue
            .ack(&self.config.queue_name, &delivery.token)
            .await
        {
            tracing::error!(
                event_id = %delivery.event.id,
                error = %e,
                "Failed to acknowledge delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dlq::{DeadLetterConfig, MemoryDeadLetterStore};
    use crate::queue::MemoryQueue;
    use crate::types::EventStatus;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::RwLock;

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(500),
            retry: RetryConfig {
                max_retries: 2,
                backoff_strategy: crate::retry::BackoffStrategy::Fixed,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter: false,
                ..RetryConfig::default()
            },
            ..ProcessorConfig::default()
        }
    }

    fn test_event(action: &str) -> AuditEvent {
        AuditEvent::new("2026-03-01T10:15:00Z", action, EventStatus::Success)
            .with_principal("user-1")
    }

    struct Fixture {
        processor: Arc<ReliableEventProcessor>,
        stored: Arc<RwLock<Vec<AuditEvent>>>,
        dlq: Arc<DeadLetterHandler>,
    }

    /// Build a processor whose persist op fails according to `fail_plan`
    /// (returns Some(error message) for a given call index).
    fn fixture(
        config: ProcessorConfig,
        fail_plan: impl Fn(u32) -> Option<&'static str> + Send + Sync + 'static,
    ) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(MemoryQueue::new(ManualClock::at(0), 60_000));
        let store = Arc::new(MemoryDeadLetterStore::new(ManualClock::at(0), 1_000));
        let dlq = Arc::new(DeadLetterHandler::new(
            DeadLetterConfig::default(),
            store,
            ManualClock::at(0),
        ));

        let stored: Arc<RwLock<Vec<AuditEvent>>> = Arc::new(RwLock::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let stored_clone = stored.clone();
        let persist: PersistFn = Arc::new(move |event| {
            let stored = stored_clone.clone();
            let calls = calls.clone();
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let failure = fail_plan(n);
            Box::pin(async move {
                if let Some(message) = failure {
                    return Err(AuditError::store(message));
                }
                stored.write().await.push(event);
                Ok(())
            })
        });

        let processor = Arc::new(ReliableEventProcessor::with_clock(
            config, queue, dlq.clone(), persist, clock,
        ));
        Fixture {
            processor,
            stored,
            dlq,
        }
    }

    async fn drain(processor: &Arc<ReliableEventProcessor>) {
        // Give workers time to pull everything through
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let health = processor.health_status().await.unwrap();
            if health.queue_depth == 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_events_persisted_and_sealed() {
        let f = fixture(fast_config(), |_| None);
        f.processor.start().await.unwrap();

        for i in 0..5 {
            f.processor
                .add_event(test_event(&format!("auth.login.success.{}", i)))
                .await
                .unwrap();
        }
        drain(&f.processor).await;
        f.processor.cleanup().await.unwrap();

        let stored = f.stored.read().await;
        assert_eq!(stored.len(), 5);
        for event in stored.iter() {
            assert!(event.is_sealed());
            assert!(
                crate::integrity::verify_event_hash(event, event.hash.as_ref().unwrap()).unwrap()
            );
        }
        assert_eq!(f.processor.stats().processed, 5);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_through() {
        // Every 3rd call fails with a retryable reset
        let f = fixture(fast_config(), |n| {
            if n % 3 == 0 {
                Some("ECONNRESET")
            } else {
                None
            }
        });
        f.processor.start().await.unwrap();

        for i in 0..6 {
            f.processor
                .add_event(test_event(&format!("fhir.patient.read.{}", i)))
                .await
                .unwrap();
        }
        drain(&f.processor).await;
        f.processor.cleanup().await.unwrap();

        // All events land: retries absorb the periodic failures
        assert_eq!(f.stored.read().await.len(), 6);
        assert_eq!(f.dlq.statistics().await.unwrap().total_events, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_first_try() {
        let f = fixture(fast_config(), |_| Some("invalid column value"));
        f.processor.start().await.unwrap();

        f.processor.add_event(test_event("auth.login.success")).await.unwrap();
        drain(&f.processor).await;
        f.processor.cleanup().await.unwrap();

        assert!(f.stored.read().await.is_empty());
        let entries = f.dlq.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        // Non-retryable: exactly one attempt recorded
        assert_eq!(entries[0].attempt_history.len(), 1);
        assert_eq!(f.processor.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_with_history() {
        let f = fixture(fast_config(), |_| Some("ECONNRESET"));
        f.processor.start().await.unwrap();

        f.processor.add_event(test_event("auth.login.success")).await.unwrap();
        drain(&f.processor).await;
        f.processor.cleanup().await.unwrap();

        let entries = f.dlq.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        // max_retries=2 → 3 calls, 3 attempt records
        assert_eq!(entries[0].attempt_history.len(), 3);
        assert_eq!(entries[0].failure_count, 3);
        assert_eq!(entries[0].original_queue, "audit-events");
        // Dead-lettered events were sealed before the write was attempted
        assert!(entries[0].original_event.is_sealed());
    }

    #[tokio::test]
    async fn test_add_event_rejects_malformed() {
        let f = fixture(fast_config(), |_| None);
        let bad = AuditEvent::new("yesterday", "auth.login.success", EventStatus::Success);
        assert!(matches!(
            f.processor.add_event(bad).await,
            Err(AuditError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let f = fixture(fast_config(), |_| None);
        f.processor.start().await.unwrap();
        assert!(f.processor.start().await.is_err());
        f.processor.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_degrades_and_recovers() {
        let mut config = fast_config();
        config.breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            minimum_throughput: 3,
            recovery_timeout_ms: 50,
            monitoring_period_ms: 60_000,
        };
        let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let failing_clone = failing.clone();
        let f = fixture(config, move |_| {
            if failing_clone.load(Ordering::SeqCst) {
                Some("ECONNRESET")
            } else {
                None
            }
        });

        let healthy_before = f.processor.health_status().await.unwrap();
        assert_eq!(healthy_before.health_score, 100);

        f.processor.start().await.unwrap();
        for i in 0..4 {
            f.processor
                .add_event(test_event(&format!("fhir.patient.read.{}", i)))
                .await
                .unwrap();
        }

        // Wait for the breaker to trip
        let mut tripped = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if f.processor.breaker().metrics().state == CircuitState::Open {
                tripped = true;
                break;
            }
        }
        assert!(tripped, "breaker never opened");

        let degraded = f.processor.health_status().await.unwrap();
        assert!(degraded.health_score < healthy_before.health_score);

        // Store recovers; fresh traffic drives the probe, the breaker
        // closes, and health climbs back
        failing.store(false, Ordering::SeqCst);
        for i in 0..2 {
            f.processor
                .add_event(test_event(&format!("fhir.patient.read.ok.{}", i)))
                .await
                .unwrap();
        }
        let mut recovered = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let health = f.processor.health_status().await.unwrap();
            if health.circuit_breaker_state == CircuitState::Closed && health.queue_depth == 0 {
                recovered = true;
                break;
            }
        }
        f.processor.cleanup().await.unwrap();
        assert!(recovered, "breaker never recovered");

        let healed = f.processor.health_status().await.unwrap();
        assert!(healed.health_score > degraded.health_score);
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let f = fixture(fast_config(), |_| None);
        f.processor.start().await.unwrap();
        f.processor.cleanup().await.unwrap();
        f.processor.cleanup().await.unwrap();
    }
}
