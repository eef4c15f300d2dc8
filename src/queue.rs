//! Durable queue primitive — the pluggable input transport
//!
//! The processor only talks to [`DurableQueue`]; backends (broker-backed,
//! database-backed, in-memory) implement it. Delivery is at-least-once:
//! a dequeued event stays leased until acked, and a nack or an expired
//! lease makes it visible again with an incremented delivery count.

use crate::clock::Clock;
use crate::error::{AuditError, Result};
use crate::types::AuditEvent;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opaque acknowledgement token for one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(pub u64);

/// One leased delivery from a queue
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The queued event
    pub event: AuditEvent,

    /// Token to ack or nack this delivery
    pub token: AckToken,

    /// Number of times this event has been delivered (1 on first delivery)
    pub num_delivered: u64,
}

/// Pluggable durable queue with lease-based acknowledgement
///
/// Implementations must persist an event before `enqueue` returns and keep
/// unacked deliveries claimable so a worker crash never loses an event.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Durably append an event to the named queue
    async fn enqueue(&self, queue: &str, event: &AuditEvent) -> Result<()>;

    /// Lease the next available event, if any (non-blocking poll)
    async fn dequeue(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing the event permanently
    async fn ack(&self, queue: &str, token: &AckToken) -> Result<()>;

    /// Negative-acknowledge a delivery, returning the event for redelivery
    async fn nack(&self, queue: &str, token: &AckToken) -> Result<()>;

    /// Number of events currently visible (not leased) in the queue
    async fn depth(&self, queue: &str) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct QueuedEntry {
    event: AuditEvent,
    num_delivered: u64,
}

#[derive(Debug, Clone)]
struct LeasedEntry {
    entry: QueuedEntry,
    leased_at: u64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedEntry>,
    inflight: HashMap<u64, LeasedEntry>,
}

/// In-memory [`DurableQueue`] for tests and single-process deployments
///
/// Leases carry a visibility timeout; expired leases are reclaimed lazily
/// on the next dequeue, modelling the redelivery contract of a real broker.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    visibility_timeout_ms: u64,
    queues: Mutex<HashMap<String, QueueState>>,
    next_token: std::sync::atomic::AtomicU64,
}

impl MemoryQueue {
    /// Create a queue with the given lease visibility timeout
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout_ms: u64) -> Self {
        Self {
            clock,
            visibility_timeout_ms,
            queues: Mutex::new(HashMap::new()),
            next_token: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Queue with a 30s visibility timeout on the system clock
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(crate::clock::SystemClock), 30_000)
    }

    fn reclaim_expired(&self, state: &mut QueueState, now: u64) {
        let expired: Vec<u64> = state
            .inflight
            .iter()
            .filter(|(_, leased)| now.saturating_sub(leased.leased_at) >= self.visibility_timeout_ms)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(leased) = state.inflight.remove(&token) {
                tracing::warn!(
                    event_id = %leased.entry.event.id,
                    num_delivered = leased.entry.num_delivered,
                    "Lease expired, event returned to queue"
                );
                state.ready.push_back(leased.entry);
            }
        }
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, event: &AuditEvent) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(QueuedEntry {
            event: event.clone(),
            num_delivered: 0,
        });
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Delivery>> {
        let now = self.clock.now_millis();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        self.reclaim_expired(state, now);

        let Some(mut entry) = state.ready.pop_front() else {
            return Ok(None);
        };
        entry.num_delivered += 1;

        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let delivery = Delivery {
            event: entry.event.clone(),
            token: AckToken(token),
            num_delivered: entry.num_delivered,
        };
        state.inflight.insert(
            token,
            LeasedEntry {
                entry,
                leased_at: now,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &str, token: &AckToken) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| AuditError::Queue {
                queue: queue.to_string(),
                reason: "unknown queue".to_string(),
            })?;
        state.inflight.remove(&token.0).ok_or_else(|| AuditError::Queue {
            queue: queue.to_string(),
            reason: format!("no in-flight delivery for token {}", token.0),
        })?;
        Ok(())
    }

    async fn nack(&self, queue: &str, token: &AckToken) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| AuditError::Queue {
                queue: queue.to_string(),
                reason: "unknown queue".to_string(),
            })?;
        let leased = state
            .inflight
            .remove(&token.0)
            .ok_or_else(|| AuditError::Queue {
                queue: queue.to_string(),
                reason: format!("no in-flight delivery for token {}", token.0),
            })?;
        state.ready.push_back(leased.entry);
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|s| s.ready.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::EventStatus;

    fn test_event(action: &str) -> AuditEvent {
        AuditEvent::new("2026-03-01T10:15:00Z", action, EventStatus::Success)
    }

    fn test_queue(clock: Arc<ManualClock>) -> MemoryQueue {
        MemoryQueue::new(clock, 10_000)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let queue = test_queue(ManualClock::at(1_000));
        queue.enqueue("audit", &test_event("auth.login.success")).await.unwrap();
        assert_eq!(queue.depth("audit").await.unwrap(), 1);

        let delivery = queue.dequeue("audit").await.unwrap().unwrap();
        assert_eq!(delivery.event.action, "auth.login.success");
        assert_eq!(delivery.num_delivered, 1);
        assert_eq!(queue.depth("audit").await.unwrap(), 0);

        queue.ack("audit", &delivery.token).await.unwrap();
        assert!(queue.dequeue("audit").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_incremented_count() {
        let queue = test_queue(ManualClock::at(1_000));
        queue.enqueue("audit", &test_event("a.b")).await.unwrap();

        let first = queue.dequeue("audit").await.unwrap().unwrap();
        queue.nack("audit", &first.token).await.unwrap();

        let second = queue.dequeue("audit").await.unwrap().unwrap();
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.num_delivered, 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = test_queue(ManualClock::at(1_000));
        for action in ["first.a", "second.b", "third.c"] {
            queue.enqueue("audit", &test_event(action)).await.unwrap();
        }

        assert_eq!(queue.dequeue("audit").await.unwrap().unwrap().event.action, "first.a");
        assert_eq!(queue.dequeue("audit").await.unwrap().unwrap().event.action, "second.b");
        assert_eq!(queue.dequeue("audit").await.unwrap().unwrap().event.action, "third.c");
    }

    #[tokio::test]
    async fn test_expired_lease_reclaimed() {
        let clock = ManualClock::at(1_000);
        let queue = test_queue(clock.clone());
        queue.enqueue("audit", &test_event("a.b")).await.unwrap();

        let first = queue.dequeue("audit").await.unwrap().unwrap();
        // Worker "crashes": never acks. Lease not yet expired:
        clock.advance(5_000);
        assert!(queue.dequeue("audit").await.unwrap().is_none());

        // After the visibility timeout the event is claimable again
        clock.advance(5_000);
        let second = queue.dequeue("audit").await.unwrap().unwrap();
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.num_delivered, 2);

        // The stale token is gone
        assert!(queue.ack("audit", &first.token).await.is_err());
    }

    #[tokio::test]
    async fn test_named_queues_isolated() {
        let queue = test_queue(ManualClock::at(1_000));
        queue.enqueue("audit", &test_event("a.b")).await.unwrap();
        queue.enqueue("audit-dlq", &test_event("c.d")).await.unwrap();

        assert_eq!(queue.depth("audit").await.unwrap(), 1);
        assert_eq!(queue.depth("audit-dlq").await.unwrap(), 1);

        let d = queue.dequeue("audit-dlq").await.unwrap().unwrap();
        assert_eq!(d.event.action, "c.d");
        assert_eq!(queue.depth("audit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ack_unknown_token_fails() {
        let queue = test_queue(ManualClock::at(1_000));
        queue.enqueue("audit", &test_event("a.b")).await.unwrap();
        let delivery = queue.dequeue("audit").await.unwrap().unwrap();
        queue.ack("audit", &delivery.token).await.unwrap();

        // Double-ack rejected
        assert!(queue.ack("audit", &delivery.token).await.is_err());
    }
}
