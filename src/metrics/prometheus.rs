//! Prometheus metrics registration and export.
//!
//! All skyscan metrics live in one process-wide registry. Recording before
//! `init_metrics` is a silent no-op, so library code never has to care
//! whether the binary enabled metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

/// Global Prometheus registry for all skyscan metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Settled deliveries, labeled by queue and outcome (ack/dead_letter/requeue).
pub static DELIVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages published, labeled by queue.
pub static PUBLISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Reconstruction wall time in seconds, labeled by status (ok/fit_failed/error).
pub static RECONSTRUCTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Pixels written to the sink, labeled by selection (best_fit/all_failed).
pub static PIXELS_EMITTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages waiting in a queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Fleet nodes that are ready (1) or not (0), labeled by role.
pub static FLEET_NODES_READY: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it again after a successful call is harmless; the first registry
/// stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let deliveries_total = CounterVec::new(
        Opts::new("skyscan_deliveries_total", "Settled queue deliveries"),
        &["queue", "outcome"],
    )?;

    let published_total = CounterVec::new(
        Opts::new("skyscan_published_total", "Messages published"),
        &["queue"],
    )?;

    let reconstruction_duration = HistogramVec::new(
        HistogramOpts::new(
            "skyscan_reconstruction_duration_seconds",
            "Reconstruction wall time in seconds",
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["status"],
    )?;

    let pixels_emitted_total = CounterVec::new(
        Opts::new("skyscan_pixels_emitted_total", "Pixels written to the sink"),
        &["selection"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("skyscan_queue_depth", "Number of messages waiting in a queue"),
        &["queue_name"],
    )?;

    let fleet_nodes_ready = GaugeVec::new(
        Opts::new("skyscan_fleet_nodes_ready", "Fleet nodes that are ready"),
        &["role"],
    )?;

    registry.register(Box::new(deliveries_total.clone()))?;
    registry.register(Box::new(published_total.clone()))?;
    registry.register(Box::new(reconstruction_duration.clone()))?;
    registry.register(Box::new(pixels_emitted_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(fleet_nodes_ready.clone()))?;

    // If any of these fail, a concurrent call won the race (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = DELIVERIES_TOTAL.set(deliveries_total);
    let _ = PUBLISHED_TOTAL.set(published_total);
    let _ = RECONSTRUCTION_DURATION.set(reconstruction_duration);
    let _ = PIXELS_EMITTED_TOTAL.set(pixels_emitted_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = FLEET_NODES_READY.set(fleet_nodes_ready);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics to `path` for a node-exporter textfile collector.
///
/// The file is written next to its destination and renamed into place so the
/// collector never reads a partial file.
pub fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let text = export_metrics();
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}
