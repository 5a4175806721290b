//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    DELIVERIES_TOTAL, FLEET_NODES_READY, PIXELS_EMITTED_TOTAL, PUBLISHED_TOTAL, QUEUE_DEPTH,
    RECONSTRUCTION_DURATION,
};

/// Metrics collector for recording skyscan operational metrics.
///
/// Cheap to create and clone; every method is a no-op until
/// `init_metrics()` has run.
///
/// # Example
///
/// ```ignore
/// use skyscan::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_delivery("inqueue", "ack");
/// collector.record_reconstruction("ok", 812.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a settled delivery.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the delivery came from
    /// * `outcome` - `"ack"`, `"dead_letter"` or `"requeue"`
    pub fn record_delivery(&self, queue: &str, outcome: &str) {
        if let Some(deliveries) = DELIVERIES_TOTAL.get() {
            deliveries.with_label_values(&[queue, outcome]).inc();
        }

        tracing::trace!(queue = queue, outcome = outcome, "Recorded delivery metric");
    }

    /// Record `count` messages published to `queue`.
    pub fn record_published(&self, queue: &str, count: u64) {
        if let Some(published) = PUBLISHED_TOTAL.get() {
            published.with_label_values(&[queue]).inc_by(count as f64);
        }
    }

    /// Record one reconstruction run.
    ///
    /// # Arguments
    ///
    /// * `status` - `"ok"`, `"fit_failed"` or `"error"`
    /// * `duration_secs` - Wall time of the run
    pub fn record_reconstruction(&self, status: &str, duration_secs: f64) {
        if let Some(duration) = RECONSTRUCTION_DURATION.get() {
            duration.with_label_values(&[status]).observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded reconstruction metric"
        );
    }

    /// Record a pixel written to the sink.
    pub fn record_emitted(&self, selection: &str) {
        if let Some(emitted) = PIXELS_EMITTED_TOTAL.get() {
            emitted.with_label_values(&[selection]).inc();
        }
    }

    /// Update the depth gauge of a queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Mark a fleet node as ready or not.
    pub fn update_node_ready(&self, role: &str, ready: bool) {
        if let Some(nodes) = FLEET_NODES_READY.get() {
            nodes
                .with_label_values(&[role])
                .set(if ready { 1.0 } else { 0.0 });
        }
    }
}
