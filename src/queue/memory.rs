//! In-process queue transport.
//!
//! Same delivery semantics as the Redis transport (FIFO, in-flight tracking,
//! requeue to the front, dead-letter on reject) without a broker. Used for
//! single-host runs and throughout the test-suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::transport::{Delivery, DeliveryTag, QueueError, QueueStats, QueueTransport};

#[derive(Debug, Default)]
struct QueueState {
    /// Bodies waiting for delivery, with their redelivery flag.
    ready: VecDeque<(Vec<u8>, bool)>,
    in_flight: HashMap<DeliveryTag, Vec<u8>>,
    dead_letter: Vec<Vec<u8>>,
}

/// Queue transport backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    published: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // A poisoned map is still structurally valid
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.lock();
        let state = queues.get_mut(queue)?;
        let (body, redelivered) = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        state.in_flight.insert(tag, body.clone());
        Some(Delivery::new(tag, queue, body, redelivered))
    }

    /// Returns queue statistics.
    pub fn stats(&self, queue: &str) -> QueueStats {
        let queues = self.lock();
        let state = queues.get(queue);
        QueueStats {
            queue_name: queue.to_string(),
            pending: state.map_or(0, |s| s.ready.len()),
            in_flight: state.map_or(0, |s| s.in_flight.len()),
            dead_letter: state.map_or(0, |s| s.dead_letter.len()),
        }
    }

    /// Copies the bodies still waiting on `queue`, oldest first.
    pub fn pending_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(queue)
            .map(|s| s.ready.iter().map(|(body, _)| body.clone()).collect())
            .unwrap_or_default()
    }

    /// Copies the bodies rejected without requeue on `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(queue)
            .map(|s| s.dead_letter.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back((body.to_vec(), false));
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent publish is not missed
            let notified = self.published.notified();
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if !delivery.claim_settle() {
            return Ok(());
        }
        if let Some(state) = self.lock().get_mut(delivery.queue()) {
            state.in_flight.remove(&delivery.tag());
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        if !delivery.claim_settle() {
            return Ok(());
        }
        {
            let mut queues = self.lock();
            let state = queues.entry(delivery.queue().to_string()).or_default();
            let body = state
                .in_flight
                .remove(&delivery.tag())
                .unwrap_or_else(|| delivery.body().to_vec());
            if requeue {
                state.ready.push_front((body, true));
            } else {
                state.dead_letter.push(body);
            }
        }
        if requeue {
            self.published.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryQueue::new();
        queue.publish("q", b"first").await.expect("publish");
        queue.publish("q", b"second").await.expect("publish");

        let first = queue
            .receive("q", Duration::from_millis(10))
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(first.body(), b"first");
        assert_eq!(queue.stats("q").in_flight, 1);

        queue.ack(&first).await.expect("ack");
        let stats = queue.stats("q");
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_ack_and_nack_are_idempotent() {
        let queue = MemoryQueue::new();
        queue.publish("q", b"only").await.expect("publish");
        let delivery = queue
            .receive("q", Duration::from_millis(10))
            .await
            .expect("receive")
            .expect("message");

        queue.ack(&delivery).await.expect("ack");
        queue.ack(&delivery).await.expect("second ack");
        queue.nack(&delivery, true).await.expect("late nack");

        let stats = queue.stats("q");
        assert_eq!(stats.total(), 0, "settled delivery must not come back");
    }

    #[tokio::test]
    async fn test_requeue_goes_to_front_and_is_flagged() {
        let queue = MemoryQueue::new();
        queue.publish("q", b"a").await.expect("publish");
        queue.publish("q", b"b").await.expect("publish");

        let a = queue
            .receive("q", Duration::from_millis(10))
            .await
            .expect("receive")
            .expect("message");
        assert!(!a.redelivered());
        queue.nack(&a, true).await.expect("nack");

        let again = queue
            .receive("q", Duration::from_millis(10))
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(again.body(), b"a");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let queue = MemoryQueue::new();
        queue.publish("q", b"poison").await.expect("publish");
        let delivery = queue
            .receive("q", Duration::from_millis(10))
            .await
            .expect("receive")
            .expect("message");

        queue.nack(&delivery, false).await.expect("nack");

        assert_eq!(queue.dead_letters("q"), vec![b"poison".to_vec()]);
        assert_eq!(queue.stats("q").pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_on_empty_queue() {
        let queue = MemoryQueue::new();
        let started = Instant::now();
        let delivery = queue
            .receive("empty", Duration::from_secs(2))
            .await
            .expect("receive");

        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let publisher = std::sync::Arc::clone(&queue);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late").await.expect("publish");
        });

        let delivery = queue
            .receive("q", Duration::from_secs(5))
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(delivery.body(), b"late");
        handle.await.expect("publisher task");
    }
}
