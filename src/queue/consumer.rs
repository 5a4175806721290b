//! Blocking consume loop with single-in-flight delivery.
//!
//! The loop pulls one delivery, runs the handler to completion, settles the
//! delivery according to the handler outcome, and only then asks for the
//! next one. Settlement follows the error taxonomy:
//!
//! | Handler outcome      | Settlement                    | Loop      |
//! |----------------------|-------------------------------|-----------|
//! | `Ok(())`             | ack                           | continues |
//! | `HandlerError::Data` | reject, no requeue            | continues |
//! | `HandlerError::Processing` | reject, requeue         | continues |
//! | `HandlerError::Transport`  | reject, requeue         | aborts    |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::idle::{ActivityClock, IdleSupervisor, ShutdownReason};
use super::transport::{Delivery, QueueError, QueueTransport};
use crate::error::DataError;
use crate::metrics::MetricsCollector;

/// Default time a single receive call blocks before the loop re-checks its
/// stop token.
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Outcome of a handler that did not complete successfully.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The body can never be processed. Discarded without retry.
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// Processing failed in a way another attempt may fix. Requeued.
    #[error("Processing error: {0}")]
    Processing(String),

    /// A downstream publish failed. Requeued, and the consumer stops.
    #[error("Transport error: {0}")]
    Transport(#[from] QueueError),
}

/// Processes one message body.
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, body: &[u8]) -> Result<(), HandlerError>;
}

/// Counters for one run of the consume loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
}

impl ConsumeStats {
    pub fn total(&self) -> u64 {
        self.acked + self.dead_lettered + self.requeued
    }
}

/// Summary of a supervised consume run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub reason: ShutdownReason,
    pub stats: ConsumeStats,
}

/// Consumes one queue through a transport.
pub struct Consumer<T: QueueTransport + ?Sized> {
    transport: Arc<T>,
    queue: String,
    receive_wait: Duration,
    metrics: MetricsCollector,
}

impl<T: QueueTransport + ?Sized> Consumer<T> {
    pub fn new(transport: Arc<T>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets how long each receive blocks before re-checking for a stop.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Runs the consume loop until `stop` is cancelled.
    ///
    /// Every delivery touches `clock`. A delivery that arrives after a stop
    /// was requested is requeued untouched. Returns an error only for
    /// transport failures, which are fatal to the consumer.
    pub async fn run<H: MessageHandler + ?Sized>(
        &self,
        handler: &mut H,
        stop: &CancellationToken,
        clock: &ActivityClock,
    ) -> Result<ConsumeStats, QueueError> {
        let mut stats = ConsumeStats::default();
        info!(queue = %self.queue, "Consumer started");

        while !stop.is_cancelled() {
            let delivery = match self.transport.receive(&self.queue, self.receive_wait).await? {
                Some(delivery) => delivery,
                None => {
                    debug!(queue = %self.queue, "No messages available");
                    continue;
                }
            };

            if stop.is_cancelled() {
                debug!(queue = %self.queue, tag = delivery.tag(), "Stop requested, returning delivery");
                self.transport.nack(&delivery, true).await?;
                stats.requeued += 1;
                break;
            }

            clock.touch();
            let outcome = handler.handle(delivery.body()).await;
            self.settle(&delivery, outcome, &mut stats).await?;
        }

        info!(
            queue = %self.queue,
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            requeued = stats.requeued,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: Result<(), HandlerError>,
        stats: &mut ConsumeStats,
    ) -> Result<(), QueueError> {
        match outcome {
            Ok(()) => {
                self.transport.ack(delivery).await?;
                stats.acked += 1;
                self.metrics.record_delivery(&self.queue, "ack");
                Ok(())
            }
            Err(HandlerError::Data(e)) => {
                warn!(
                    queue = %self.queue,
                    tag = delivery.tag(),
                    error = %e,
                    "Discarding malformed message"
                );
                self.transport.nack(delivery, false).await?;
                stats.dead_lettered += 1;
                self.metrics.record_delivery(&self.queue, "dead_letter");
                Ok(())
            }
            Err(HandlerError::Processing(reason)) => {
                warn!(
                    queue = %self.queue,
                    tag = delivery.tag(),
                    redelivered = delivery.redelivered(),
                    error = %reason,
                    "Processing failed, requeueing message"
                );
                self.transport.nack(delivery, true).await?;
                stats.requeued += 1;
                self.metrics.record_delivery(&self.queue, "requeue");
                Ok(())
            }
            Err(HandlerError::Transport(e)) => {
                error!(
                    queue = %self.queue,
                    tag = delivery.tag(),
                    error = %e,
                    "Transport failure while handling message"
                );
                if let Err(nack_err) = self.transport.nack(delivery, true).await {
                    error!(error = %nack_err, "Failed to requeue message after transport failure");
                }
                stats.requeued += 1;
                self.metrics.record_delivery(&self.queue, "requeue");
                Err(e)
            }
        }
    }

    /// Runs the consume loop under an idle-timeout supervisor.
    ///
    /// Returns once the queue has been idle for `idle_timeout`, `parent` is
    /// cancelled, or a transport failure occurs.
    pub async fn run_supervised<H: MessageHandler + ?Sized>(
        &self,
        handler: &mut H,
        idle_timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<ConsumeReport, QueueError> {
        let supervisor = IdleSupervisor::new(idle_timeout, ActivityClock::new());
        self.run_with_supervisor(handler, supervisor, parent).await
    }

    /// Like `run_supervised` with an explicitly configured supervisor.
    pub async fn run_with_supervisor<H: MessageHandler + ?Sized>(
        &self,
        handler: &mut H,
        supervisor: IdleSupervisor,
        parent: &CancellationToken,
    ) -> Result<ConsumeReport, QueueError> {
        let stop = CancellationToken::new();
        let clock = supervisor.clock().clone();
        let timer = supervisor.spawn(parent.clone(), stop.clone());

        let result = self.run(handler, &stop, &clock).await;

        // Stop the timer if the loop exited on its own
        stop.cancel();
        let reason = timer.await.unwrap_or(ShutdownReason::LoopExited);

        let stats = result?;
        info!(queue = %self.queue, reason = %reason, "Consumer shut down");
        Ok(ConsumeReport { reason, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    struct ScriptedHandler {
        outcomes: Vec<Result<(), HandlerError>>,
        seen: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&mut self, body: &[u8]) -> Result<(), HandlerError> {
            self.seen.push(body.to_vec());
            if self.outcomes.is_empty() {
                Ok(())
            } else {
                self.outcomes.remove(0)
            }
        }
    }

    fn handler(outcomes: Vec<Result<(), HandlerError>>) -> ScriptedHandler {
        ScriptedHandler {
            outcomes,
            seen: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_follows_handler_outcome() {
        let queue = Arc::new(MemoryQueue::new());
        queue.publish("in", b"good").await.expect("publish");
        queue.publish("in", b"bad").await.expect("publish");
        queue.publish("in", b"flaky").await.expect("publish");

        let mut handler = handler(vec![
            Ok(()),
            Err(HandlerError::Data(DataError::Malformed("nope".to_string()))),
            Err(HandlerError::Processing("try again".to_string())),
        ]);

        let consumer = Consumer::new(Arc::clone(&queue), "in");
        let report = consumer
            .run_supervised(&mut handler, Duration::from_secs(3), &CancellationToken::new())
            .await
            .expect("consume");

        assert_eq!(report.reason, ShutdownReason::IdleTimeout);
        // The requeued message comes straight back and succeeds
        assert_eq!(handler.seen.len(), 4);
        assert_eq!(handler.seen[3], b"flaky");
        assert_eq!(
            report.stats,
            ConsumeStats {
                acked: 2,
                dead_lettered: 1,
                requeued: 1
            }
        );
        assert_eq!(queue.dead_letters("in"), vec![b"bad".to_vec()]);
        let stats = queue.stats("in");
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_aborts_and_requeues() {
        let queue = Arc::new(MemoryQueue::new());
        queue.publish("in", b"job").await.expect("publish");

        let mut handler = handler(vec![Err(HandlerError::Transport(QueueError::Closed(
            "out".to_string(),
        )))]);

        let consumer = Consumer::new(Arc::clone(&queue), "in");
        let result = consumer
            .run_supervised(&mut handler, Duration::from_secs(60), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(QueueError::Closed(_))));
        let stats = queue.stats("in");
        assert_eq!(stats.pending, 1, "message must be back on the queue");
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stop_leaves_nothing_unacknowledged() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..5u8 {
            queue.publish("in", &[i]).await.expect("publish");
        }

        let mut handler = handler(Vec::new());
        let consumer = Consumer::new(Arc::clone(&queue), "in");

        let started = tokio::time::Instant::now();
        let report = consumer
            .run_supervised(&mut handler, Duration::from_secs(10), &CancellationToken::new())
            .await
            .expect("consume");

        assert_eq!(report.reason, ShutdownReason::IdleTimeout);
        assert_eq!(report.stats.acked, 5);
        assert_eq!(queue.stats("in").total(), 0);
        // Timeout plus at most one poll interval plus one receive wait
        assert!(started.elapsed() <= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_stops_consumer() {
        let queue = Arc::new(MemoryQueue::new());
        let parent = CancellationToken::new();
        let mut handler = handler(Vec::new());
        let consumer = Consumer::new(Arc::clone(&queue), "in");

        let interrupter = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            interrupter.cancel();
        });

        let report = consumer
            .run_supervised(&mut handler, Duration::from_secs(3600), &parent)
            .await
            .expect("consume");
        assert_eq!(report.reason, ShutdownReason::Interrupted);
        assert_eq!(report.stats.total(), 0);
    }

    #[test]
    fn test_consume_stats_total() {
        let stats = ConsumeStats {
            acked: 3,
            dead_lettered: 1,
            requeued: 2,
        };
        assert_eq!(stats.total(), 6);
    }
}
