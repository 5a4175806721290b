//! The scan pipeline: producer, worker and consolidator roles.
//!
//! # Flow
//!
//! 1. **Producer** splits an event into `(pixel, variant)` jobs and publishes
//!    them to the work queue
//! 2. **Workers** consume jobs one at a time, run the reconstruction and
//!    publish a scored result before acknowledging the job
//! 3. **Consolidator** collects results per pixel until every variant has
//!    arrived, selects the best fit and writes it to the result sink
//!
//! Every consuming role stops on its own once its queue has been idle for
//! the configured timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use skyscan::pipeline::{run_consolidator, ConsolidatorConfig, DirectorySink};
//! use skyscan::queue::RedisQueue;
//!
//! let transport = Arc::new(RedisQueue::connect("localhost").await?);
//! let config = ConsolidatorConfig::new().with_variants(7).with_output_dir("./results");
//! let sink = Arc::new(DirectorySink::new(&config.output_dir));
//!
//! let report = run_consolidator(&config, transport, sink, &token).await?;
//! println!("emitted {} pixels, {} incomplete", report.emitted, report.incomplete.len());
//! ```

pub mod config;
pub mod consolidator;
pub mod producer;
pub mod reconstruct;
pub mod sink;
pub mod worker;

pub use config::{ConfigError, ConsolidatorConfig, QueueConfig, WorkerConfig, DEFAULT_VARIANTS};
pub use consolidator::{
    run_consolidator, Arrival, ConsolidationReport, Consolidator, ConsolidatorService,
    IncompleteGroup, IncompleteReport, PixelGroup, SelectedResult, Selection,
};
pub use producer::{
    pixel_count, EventSplitter, PixelScanSplitter, ProduceError, Producer, SplitJobs, MAX_NSIDE,
};
pub use reconstruct::{CommandReconstructor, Reconstruction, Reconstructor};
pub use sink::{DirectorySink, ResultSidecar, ResultSink};
pub use worker::{run_worker, WorkerService};
