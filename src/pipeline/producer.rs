//! Event fan-out: splits one event into pixel jobs and publishes them.

use std::borrow::Borrow;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::error::DataError;
use crate::message::{encode, JobDescription, JobKey};
use crate::metrics::MetricsCollector;
use crate::queue::{QueueError, QueueTransport};

/// Errors raised while producing jobs for an event.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The event could not be split into jobs.
    #[error("Failed to split event: {0}")]
    Split(#[from] DataError),

    /// Publishing stopped part way through the fan-out.
    #[error("Published {published} of {total} jobs before failing: {source}")]
    Partial {
        published: usize,
        total: usize,
        #[source]
        source: QueueError,
    },
}

/// Highest resolution the pixel scheme supports.
pub const MAX_NSIDE: u32 = 1 << 29;

/// Jobs of one event, generated lazily in publish order.
pub struct SplitJobs<'a> {
    total: usize,
    jobs: Box<dyn Iterator<Item = JobDescription> + Send + 'a>,
}

impl<'a> SplitJobs<'a> {
    pub fn new(total: usize, jobs: impl Iterator<Item = JobDescription> + Send + 'a) -> Self {
        Self {
            total,
            jobs: Box::new(jobs),
        }
    }

    /// Number of jobs the event splits into.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for SplitJobs<'_> {
    type Item = JobDescription;

    fn next(&mut self) -> Option<JobDescription> {
        self.jobs.next()
    }
}

/// Turns one event into the set of jobs that scan it.
pub trait EventSplitter: Send + Sync {
    /// Validates `event` and returns its jobs without materializing them.
    fn split<'a>(&'a self, event: &'a [u8]) -> Result<SplitJobs<'a>, DataError>;
}

/// Number of pixels covering the sphere at resolution `nside`.
///
/// `None` if the count does not fit in a `u64`.
pub fn pixel_count(nside: u32) -> Option<u64> {
    let nside = u64::from(nside);
    nside.checked_mul(nside)?.checked_mul(12)
}

/// Scans every pixel at one resolution with a fixed number of position variants.
///
/// Jobs are ordered pixel-major so all variants of a pixel are published
/// together. Each job carries the raw event as its payload.
#[derive(Debug, Clone, Copy)]
pub struct PixelScanSplitter {
    pub nside: u32,
    pub variants: u32,
}

impl PixelScanSplitter {
    pub fn new(nside: u32, variants: u32) -> Self {
        Self { nside, variants }
    }

    fn job_total(&self) -> Result<usize, DataError> {
        if self.nside == 0 || !self.nside.is_power_of_two() {
            return Err(DataError::InvalidEvent(format!(
                "nside must be a power of two, got {}",
                self.nside
            )));
        }
        if self.nside > MAX_NSIDE {
            return Err(DataError::InvalidEvent(format!(
                "nside {} exceeds the maximum of {}",
                self.nside, MAX_NSIDE
            )));
        }
        if self.variants == 0 {
            return Err(DataError::InvalidEvent(
                "at least one variant is required".to_string(),
            ));
        }

        pixel_count(self.nside)
            .and_then(|pixels| pixels.checked_mul(u64::from(self.variants)))
            .and_then(|jobs| usize::try_from(jobs).ok())
            .ok_or_else(|| {
                DataError::InvalidEvent(format!(
                    "{} variants at nside {} is too many jobs",
                    self.variants, self.nside
                ))
            })
    }
}

impl EventSplitter for PixelScanSplitter {
    fn split<'a>(&'a self, event: &'a [u8]) -> Result<SplitJobs<'a>, DataError> {
        if event.is_empty() {
            return Err(DataError::InvalidEvent("event is empty".to_string()));
        }
        let total = self.job_total()?;

        let nside = self.nside;
        let variants = self.variants;
        let pixels = (total / variants as usize) as u64;
        let jobs = (0..pixels).flat_map(move |pixel| {
            let key = JobKey::new(nside, pixel);
            (0..variants).map(move |variant| JobDescription::new(key, variant, event.to_vec()))
        });
        Ok(SplitJobs::new(total, jobs))
    }
}

/// Publishes jobs to the work queue.
pub struct Producer {
    transport: Arc<dyn QueueTransport>,
    queue: String,
    metrics: MetricsCollector,
}

impl Producer {
    pub fn new(transport: Arc<dyn QueueTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Splits `event` and publishes every resulting job as it is generated.
    ///
    /// Returns the number of jobs published.
    pub async fn produce(&self, splitter: &dyn EventSplitter, event: &[u8]) -> Result<usize, ProduceError> {
        let jobs = splitter.split(event)?;
        info!(queue = %self.queue, jobs = jobs.total(), "Event split into jobs");
        self.publish_stream(jobs.total(), jobs).await
    }

    /// Publishes `jobs` in order, without retries.
    ///
    /// A failure part way through is reported as `ProduceError::Partial` with
    /// the number of jobs already on the queue.
    pub async fn publish_all(&self, jobs: &[JobDescription]) -> Result<usize, ProduceError> {
        self.publish_stream(jobs.len(), jobs.iter()).await
    }

    async fn publish_stream<I, J>(&self, total: usize, jobs: I) -> Result<usize, ProduceError>
    where
        I: Iterator<Item = J>,
        J: Borrow<JobDescription>,
    {
        for (published, job) in jobs.enumerate() {
            let job = job.borrow();
            let body = encode(job)?;
            if let Err(source) = self.transport.publish(&self.queue, &body).await {
                self.metrics.record_published(&self.queue, published as u64);
                return Err(ProduceError::Partial {
                    published,
                    total,
                    source,
                });
            }
            debug!(key = %job.job_key, variant = job.variant, "Published job");
        }

        self.metrics.record_published(&self.queue, total as u64);
        info!(queue = %self.queue, published = total, "All jobs published");
        Ok(total)
    }
}
