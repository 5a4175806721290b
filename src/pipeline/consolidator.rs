//! Fan-in of redundant variant results into one result per pixel.
//!
//! # Lifecycle of a pixel
//!
//! ```text
//! Empty --first arrival--> Collecting --K distinct variants--> Complete --sink ok--> Emitted
//! ```
//!
//! A pixel that never reaches K distinct variants stays `Collecting` and is
//! listed in the `IncompleteReport` returned by `Consolidator::finish`.
//!
//! # Selection
//!
//! The selected result is the arrival with the lowest defined score; ties go
//! to the earliest arrival. When no arrival has a defined score the first
//! arrival is selected and marked `Selection::AllFailed`.
//!
//! # Idempotence
//!
//! Emission is two-phase. `record` reports a complete pixel but keeps its
//! group; only `mark_emitted`, called after the sink accepted the result,
//! evicts the group and remembers the key. A sink failure therefore leaves
//! the pixel ready to emit on the next arrival, and arrivals for a key that
//! was already emitted are ignored.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ConsolidatorConfig;
use super::sink::ResultSink;
use crate::error::DataError;
use crate::message::{decode, JobKey, ResultMessage};
use crate::metrics::MetricsCollector;
use crate::queue::{
    ActivityClock, ConsumeReport, Consumer, HandlerError, IdleSupervisor, MessageHandler,
    QueueError, QueueTransport,
};

/// How the emitted result of a pixel was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Lowest defined score among the arrivals.
    BestFit,
    /// Every fit failed; the first arrival is passed on as a placeholder.
    AllFailed,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::BestFit => "best_fit",
            Selection::AllFailed => "all_failed",
        }
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result chosen for a complete pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedResult {
    pub result: ResultMessage,
    pub selection: Selection,
    /// Distinct variants that contributed.
    pub variants_seen: usize,
    /// Arrivals including duplicate variants.
    pub arrivals: usize,
}

/// Results received so far for one pixel, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct PixelGroup {
    arrivals: Vec<ResultMessage>,
    variants: BTreeSet<u32>,
}

impl PixelGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an arrival. Returns false if its variant was already present.
    pub fn add(&mut self, result: ResultMessage) -> bool {
        let fresh = self.variants.insert(result.variant);
        self.arrivals.push(result);
        fresh
    }

    pub fn distinct_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn arrivals(&self) -> &[ResultMessage] {
        &self.arrivals
    }

    pub fn is_complete(&self, expected: u32) -> bool {
        self.variants.len() >= expected as usize
    }

    /// Picks the result to emit. `None` only for an empty group.
    pub fn select(&self) -> Option<SelectedResult> {
        let first = self.arrivals.first()?;

        // Strict comparison keeps the earliest of equal scores
        let best = self
            .arrivals
            .iter()
            .filter(|r| r.score.is_defined())
            .fold(None::<&ResultMessage>, |best, candidate| match best {
                Some(current) if !candidate.score.is_better_than(&current.score) => Some(current),
                _ => Some(candidate),
            });

        let (result, selection) = match best {
            Some(result) => (result, Selection::BestFit),
            None => (first, Selection::AllFailed),
        };

        Some(SelectedResult {
            result: result.clone(),
            selection,
            variants_seen: self.variants.len(),
            arrivals: self.arrivals.len(),
        })
    }
}

/// Outcome of recording one result.
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival {
    /// The pixel still waits for more variants.
    Collecting { distinct: usize, expected: u32 },
    /// The pixel is complete; hand the result to the sink, then call
    /// `mark_emitted`.
    Complete(SelectedResult),
    /// The pixel was emitted before; the arrival is a redelivery.
    AlreadyEmitted,
}

/// A pixel that never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteGroup {
    pub key: JobKey,
    pub variants_seen: Vec<u32>,
    pub arrivals: usize,
}

/// Pixels still collecting at shutdown, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncompleteReport {
    pub expected: u32,
    pub groups: Vec<IncompleteGroup>,
}

impl IncompleteReport {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Logs one warning per incomplete pixel.
    pub fn log(&self) {
        if self.is_empty() {
            return;
        }
        warn!(
            incomplete = self.groups.len(),
            expected_variants = self.expected,
            "Pixels left incomplete at shutdown"
        );
        for group in &self.groups {
            warn!(
                key = %group.key,
                variants = ?group.variants_seen,
                arrivals = group.arrivals,
                "Incomplete pixel"
            );
        }
    }
}

/// Per-pixel aggregation state.
#[derive(Debug)]
pub struct Consolidator {
    expected: u32,
    groups: HashMap<JobKey, PixelGroup>,
    emitted: HashSet<JobKey>,
}

impl Consolidator {
    /// Creates a consolidator that completes a pixel at `expected` distinct variants.
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            groups: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of pixels currently collecting.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Number of pixels emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted.len()
    }

    /// Records one result.
    ///
    /// # Errors
    ///
    /// Returns `DataError::VariantOutOfRange` for a variant index that can
    /// never count toward completion.
    pub fn record(&mut self, result: ResultMessage) -> Result<Arrival, DataError> {
        if result.variant >= self.expected {
            return Err(DataError::VariantOutOfRange {
                variant: result.variant,
                expected: self.expected,
            });
        }

        let key = result.job_key;
        if self.emitted.contains(&key) {
            return Ok(Arrival::AlreadyEmitted);
        }

        let group = self.groups.entry(key).or_default();
        if !group.add(result) {
            debug!(key = %key, "Duplicate variant arrival");
        }

        if !group.is_complete(self.expected) {
            return Ok(Arrival::Collecting {
                distinct: group.distinct_variants(),
                expected: self.expected,
            });
        }

        match group.select() {
            Some(selected) => Ok(Arrival::Complete(selected)),
            None => Ok(Arrival::Collecting {
                distinct: 0,
                expected: self.expected,
            }),
        }
    }

    /// Evicts a pixel whose result reached the sink.
    pub fn mark_emitted(&mut self, key: JobKey) {
        self.groups.remove(&key);
        self.emitted.insert(key);
    }

    /// Ends aggregation and reports every pixel still collecting.
    pub fn finish(self) -> IncompleteReport {
        let mut groups: Vec<IncompleteGroup> = self
            .groups
            .into_iter()
            .map(|(key, group)| IncompleteGroup {
                key,
                variants_seen: group.variants.iter().copied().collect(),
                arrivals: group.arrivals.len(),
            })
            .collect();
        groups.sort_by_key(|g| g.key);

        IncompleteReport {
            expected: self.expected,
            groups,
        }
    }
}

/// Message handler that feeds results through a `Consolidator` into a sink.
pub struct ConsolidatorService {
    consolidator: Consolidator,
    sink: Arc<dyn ResultSink>,
    metrics: MetricsCollector,
}

impl ConsolidatorService {
    pub fn new(expected: u32, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            consolidator: Consolidator::new(expected),
            sink,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    /// Consumes the service and returns the shutdown report.
    pub fn finish(self) -> IncompleteReport {
        self.consolidator.finish()
    }
}

#[async_trait]
impl MessageHandler for ConsolidatorService {
    async fn handle(&mut self, body: &[u8]) -> Result<(), HandlerError> {
        let result = decode::<ResultMessage>(body)?.payload;
        let key = result.job_key;

        match self.consolidator.record(result)? {
            Arrival::Collecting { distinct, expected } => {
                debug!(key = %key, distinct, expected, "Pixel collecting");
                Ok(())
            }
            Arrival::AlreadyEmitted => {
                debug!(key = %key, "Ignoring result for emitted pixel");
                Ok(())
            }
            Arrival::Complete(selected) => {
                self.sink
                    .write(&selected)
                    .await
                    .map_err(|e| HandlerError::Processing(e.to_string()))?;
                self.consolidator.mark_emitted(key);
                self.metrics.record_emitted(selected.selection.as_str());

                if selected.selection == Selection::AllFailed {
                    warn!(key = %key, arrivals = selected.arrivals, "All fits failed, emitting first arrival");
                } else {
                    info!(
                        key = %key,
                        variant = selected.result.variant,
                        score = %selected.result.score,
                        "All variants arrived, emitted best fit"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Summary of a consolidator run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationReport {
    pub consume: ConsumeReport,
    pub emitted: usize,
    pub incomplete: IncompleteReport,
}

/// Runs the consolidator until its queue goes idle or `token` is cancelled.
pub async fn run_consolidator(
    config: &ConsolidatorConfig,
    transport: Arc<dyn QueueTransport>,
    sink: Arc<dyn ResultSink>,
    token: &CancellationToken,
) -> Result<ConsolidationReport, QueueError> {
    let mut service = ConsolidatorService::new(config.variants, sink);

    let consumer =
        Consumer::new(transport, &config.queue_name).with_receive_wait(config.queue.receive_wait);
    let supervisor = IdleSupervisor::new(config.queue.idle_timeout, ActivityClock::new())
        .with_poll_interval(config.queue.poll_interval);

    let outcome = consumer
        .run_with_supervisor(&mut service, supervisor, token)
        .await;

    let emitted = service.consolidator().emitted();
    let incomplete = service.finish();
    incomplete.log();
    let consume = outcome?;

    info!(
        queue = %config.queue_name,
        emitted,
        incomplete = incomplete.len(),
        reason = %consume.reason,
        "Consolidator finished"
    );
    Ok(ConsolidationReport {
        consume,
        emitted,
        incomplete,
    })
}
