//! Worker service: consumes jobs, reconstructs, publishes results.
//!
//! The input delivery is acknowledged only after the result has been
//! published, so a crash between the two leaves the job on the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::WorkerConfig;
use super::reconstruct::Reconstructor;
use crate::error::ReconstructError;
use crate::message::{decode, encode, JobDescription, Score};
use crate::metrics::MetricsCollector;
use crate::queue::{
    ActivityClock, ConsumeReport, Consumer, HandlerError, IdleSupervisor, MessageHandler,
    QueueError, QueueTransport,
};

/// Message handler that turns jobs into results.
pub struct WorkerService {
    reconstructor: Arc<dyn Reconstructor>,
    transport: Arc<dyn QueueTransport>,
    out_queue: String,
    sleep: Duration,
    metrics: MetricsCollector,
    processed: u64,
}

impl WorkerService {
    pub fn new(
        reconstructor: Arc<dyn Reconstructor>,
        transport: Arc<dyn QueueTransport>,
        out_queue: impl Into<String>,
    ) -> Self {
        Self {
            reconstructor,
            transport,
            out_queue: out_queue.into(),
            sleep: Duration::ZERO,
            metrics: MetricsCollector::new(),
            processed: 0,
        }
    }

    /// Adds an artificial delay after every reconstruction.
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Jobs that produced a published result.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

#[async_trait]
impl MessageHandler for WorkerService {
    async fn handle(&mut self, body: &[u8]) -> Result<(), HandlerError> {
        let job = decode::<JobDescription>(body)?.payload;
        info!(key = %job.job_key, variant = job.variant, "Received job");

        let start = Instant::now();
        let outcome = self.reconstructor.reconstruct(&job).await;
        let elapsed = start.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(reconstruction) => {
                self.metrics.record_reconstruction("ok", elapsed);
                job.into_result(reconstruction.score, reconstruction.payload)
            }
            Err(ReconstructError::FitFailed(reason)) => {
                warn!(key = %job.job_key, variant = job.variant, reason = %reason, "Fit failed");
                self.metrics.record_reconstruction("fit_failed", elapsed);
                job.into_result(Score::undefined(), Vec::new())
            }
            Err(e) => {
                self.metrics.record_reconstruction("error", elapsed);
                return Err(HandlerError::Processing(e.to_string()));
            }
        };

        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }

        let out = encode(&result)?;
        self.transport.publish(&self.out_queue, &out).await?;
        self.metrics.record_published(&self.out_queue, 1);
        self.processed += 1;

        info!(
            key = %result.job_key,
            variant = result.variant,
            score = %result.score,
            "Published result"
        );
        Ok(())
    }
}

/// Runs a worker until its input queue goes idle or `token` is cancelled.
pub async fn run_worker(
    config: &WorkerConfig,
    transport: Arc<dyn QueueTransport>,
    reconstructor: Arc<dyn Reconstructor>,
    token: &CancellationToken,
) -> Result<ConsumeReport, QueueError> {
    let mut service = WorkerService::new(reconstructor, Arc::clone(&transport), &config.out_queue)
        .with_sleep(config.sleep);

    let consumer =
        Consumer::new(transport, &config.in_queue).with_receive_wait(config.queue.receive_wait);
    let supervisor = IdleSupervisor::new(config.queue.idle_timeout, ActivityClock::new())
        .with_poll_interval(config.queue.poll_interval);

    let report = consumer
        .run_with_supervisor(&mut service, supervisor, token)
        .await?;

    info!(
        in_queue = %config.in_queue,
        processed = service.processed(),
        reason = %report.reason,
        "Worker finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JobKey, ResultMessage};
    use crate::pipeline::reconstruct::Reconstruction;
    use crate::queue::{Delivery, MemoryQueue};

    /// Scores a job by its variant; variant 13 fails the fit, variant 99 crashes.
    struct MockReconstructor;

    #[async_trait]
    impl Reconstructor for MockReconstructor {
        async fn reconstruct(&self, job: &JobDescription) -> Result<Reconstruction, ReconstructError> {
            match job.variant {
                13 => Err(ReconstructError::FitFailed("no convergence".to_string())),
                99 => Err(ReconstructError::Crashed("segfault".to_string())),
                v => Ok(Reconstruction {
                    score: Score::new(f64::from(v) + 0.5),
                    payload: b"fit".to_vec(),
                }),
            }
        }
    }

    fn service(queue: &Arc<MemoryQueue>) -> WorkerService {
        WorkerService::new(Arc::new(MockReconstructor), queue.clone(), "outqueue")
    }

    fn published(queue: &MemoryQueue) -> Vec<ResultMessage> {
        queue
            .pending_bodies("outqueue")
            .iter()
            .map(|b| decode::<ResultMessage>(b).expect("decode").payload)
            .collect()
    }

    #[tokio::test]
    async fn test_job_produces_result() {
        let queue = Arc::new(MemoryQueue::new());
        let mut worker = service(&queue);

        let body = encode(&JobDescription::new(JobKey::new(1, 4), 2, b"event".to_vec())).expect("encode");
        worker.handle(&body).await.expect("handle");

        let results = published(&queue);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].job_key, JobKey::new(1, 4));
        assert_eq!(results[0].variant, 2);
        assert_eq!(results[0].score.value(), 2.5);
        assert_eq!(worker.processed(), 1);
    }

    #[tokio::test]
    async fn test_fit_failure_publishes_undefined_score() {
        let queue = Arc::new(MemoryQueue::new());
        let mut worker = service(&queue);

        let body = encode(&JobDescription::new(JobKey::new(1, 0), 13, b"e".to_vec())).expect("encode");
        worker.handle(&body).await.expect("fit failure is not an error");

        let results = published(&queue);
        assert_eq!(results.len(), 1);
        assert!(!results[0].score.is_defined());
    }

    #[tokio::test]
    async fn test_crash_is_processing_error() {
        let queue = Arc::new(MemoryQueue::new());
        let mut worker = service(&queue);

        let body = encode(&JobDescription::new(JobKey::new(1, 0), 99, b"e".to_vec())).expect("encode");
        let err = worker.handle(&body).await.unwrap_err();

        assert!(matches!(err, HandlerError::Processing(ref m) if m.contains("segfault")));
        assert!(published(&queue).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_data_error() {
        let queue = Arc::new(MemoryQueue::new());
        let mut worker = service(&queue);

        let err = worker.handle(b"not json").await.unwrap_err();
        assert!(matches!(err, HandlerError::Data(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_delays_publication() {
        let queue = Arc::new(MemoryQueue::new());
        let mut worker = service(&queue).with_sleep(Duration::from_secs(30));

        let body = encode(&JobDescription::new(JobKey::new(1, 0), 0, b"e".to_vec())).expect("encode");
        let start = tokio::time::Instant::now();
        worker.handle(&body).await.expect("handle");

        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_worker_drains_queue() {
        let queue = Arc::new(MemoryQueue::new());
        for pixel in 0..3 {
            let body = encode(&JobDescription::new(JobKey::new(1, pixel), 0, b"e".to_vec())).expect("encode");
            queue.publish("inqueue", &body).await.expect("publish");
        }
        queue.publish("inqueue", b"garbage").await.expect("publish");

        let config = WorkerConfig::default();
        let report = run_worker(
            &config,
            queue.clone(),
            Arc::new(MockReconstructor),
            &CancellationToken::new(),
        )
        .await
        .expect("worker");

        assert_eq!(report.stats.acked, 3);
        assert_eq!(report.stats.dead_lettered, 1);
        assert_eq!(published(&queue).len(), 3);
        assert_eq!(queue.stats("inqueue").total(), 1, "only the dead letter remains");
    }

    /// Memory queue whose output queue refuses every publish.
    struct ClosedOutput {
        inner: Arc<MemoryQueue>,
    }

    #[async_trait]
    impl QueueTransport for ClosedOutput {
        async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
            if queue == "outqueue" {
                return Err(QueueError::Closed(queue.to_string()));
            }
            self.inner.publish(queue, body).await
        }

        async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
            self.inner.receive(queue, wait).await
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
            self.inner.nack(delivery, requeue).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_result_publish_requeues_job() {
        let queue = Arc::new(MemoryQueue::new());
        let body = encode(&JobDescription::new(JobKey::new(1, 7), 3, b"e".to_vec())).expect("encode");
        queue.publish("inqueue", &body).await.expect("publish");

        let transport = Arc::new(ClosedOutput {
            inner: queue.clone(),
        });
        let result = run_worker(
            &WorkerConfig::default(),
            transport,
            Arc::new(MockReconstructor),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(QueueError::Closed(ref q)) if q == "outqueue"));
        let stats = queue.stats("inqueue");
        assert_eq!(stats.pending, 1, "job must be back on the queue");
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_letter, 0);
        assert_eq!(queue.pending_bodies("inqueue"), [body]);
        assert!(published(&queue).is_empty());
    }
}
