//! Transport abstraction over a message queue broker.
//!
//! A transport publishes opaque bodies, hands out one `Delivery` at a time
//! and settles each delivery exactly once, by acknowledging it or rejecting
//! it with or without requeue. Settling an already-settled delivery is a
//! no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Publishing a message failed.
    #[error("Publish to '{queue}' failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    /// The transport has been closed.
    #[error("Queue '{0}' is closed")]
    Closed(String),
}

/// Opaque per-delivery identifier assigned by the transport.
pub type DeliveryTag = u64;

/// A message handed to a consumer, doubling as its acknowledgement handle.
#[derive(Debug, Clone)]
pub struct Delivery {
    tag: DeliveryTag,
    queue: String,
    body: Arc<[u8]>,
    redelivered: bool,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, queue: impl Into<String>, body: Vec<u8>, redelivered: bool) -> Self {
        Self {
            tag,
            queue: queue.into(),
            body: body.into(),
            redelivered,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker has handed this body out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Claims the right to settle this delivery.
    ///
    /// Returns false if it was already acknowledged or rejected; transports
    /// must then skip the broker call.
    pub fn claim_settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A message queue broker connection.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publishes a body to the named queue.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next message on the named queue.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. The returned delivery
    /// stays in flight until it is settled.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledges a delivery, removing it from the broker for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Rejects a delivery. With `requeue` it becomes available again,
    /// otherwise it is moved to the dead-letter queue.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Messages waiting to be delivered.
    pub pending: usize,
    /// Messages delivered but not yet settled.
    pub in_flight: usize,
    /// Messages rejected without requeue.
    pub dead_letter: usize,
}

impl QueueStats {
    /// Returns the total number of messages across all states.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.dead_letter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_settles_once() {
        let delivery = Delivery::new(1, "inqueue", b"body".to_vec(), false);
        assert!(!delivery.is_settled());
        assert!(delivery.claim_settle());
        assert!(delivery.is_settled());
        assert!(!delivery.claim_settle());

        // Clones share the settle state
        let clone = delivery.clone();
        assert!(!clone.claim_settle());
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::PublishFailed {
            queue: "outqueue".to_string(),
            reason: "broken pipe".to_string(),
        };
        assert!(err.to_string().contains("outqueue"));
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending: 10,
            in_flight: 1,
            dead_letter: 2,
        };
        assert_eq!(stats.total(), 13);
    }
}
