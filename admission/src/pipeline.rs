//! The ordered admission pipeline and the stage contract.

use crate::record::TelemetryRecord;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Default number of records processed between cancellation checks.
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 256;

/// Result of running one batch through a stage or the whole pipeline.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Records admitted downstream, in input order (coalesced overflow records last).
    pub records: Vec<TelemetryRecord>,
    /// `true` if processing stopped early because the batch was cancelled.
    pub cancelled: bool,
    /// Input records never examined because of cancellation.
    pub unprocessed: usize,
}

impl BatchOutcome {
    /// Outcome for a batch processed to completion.
    #[must_use]
    pub const fn complete(records: Vec<TelemetryRecord>) -> Self {
        Self {
            records,
            cancelled: false,
            unprocessed: 0,
        }
    }

    /// Outcome for a batch that stopped with `unprocessed` records left.
    #[must_use]
    pub const fn partial(records: Vec<TelemetryRecord>, unprocessed: usize) -> Self {
        Self {
            records,
            cancelled: true,
            unprocessed,
        }
    }
}

/// A stateful, synchronous admission stage.
///
/// `process_batch` never blocks on I/O and never fails. Records leave the batch
/// only through counted admission decisions.
pub trait Processor: Send + Sync {
    /// Short stable name, used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Filters or transforms one batch.
    fn process_batch(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome;

    /// Periodic maintenance: window rollover, timers, TTL purge.
    fn housekeep(&self);

    /// Forwards pending decision counters to the metrics recorder.
    fn flush_telemetry(&self);

    /// JSON view of the stage's counters and state sizes.
    fn snapshot(&self) -> serde_json::Value;
}

/// Tracks when a stage should poll its cancellation token.
#[derive(Debug)]
pub(crate) struct CancelCheck<'a> {
    token: &'a CancellationToken,
    interval: usize,
}

impl<'a> CancelCheck<'a> {
    pub(crate) fn new(token: &'a CancellationToken, interval: usize) -> Self {
        Self {
            token,
            interval: interval.max(1),
        }
    }

    /// Returns `true` if the batch should stop before record `index`.
    pub(crate) fn should_stop(&self, index: usize) -> bool {
        index > 0 && index % self.interval == 0 && self.token.is_cancelled()
    }
}

/// Stages run in order over each batch.
pub struct AdmissionPipeline {
    stages: Vec<Arc<dyn Processor>>,
    cancel_check_interval: usize,
}

impl AdmissionPipeline {
    /// Creates a pipeline from stages in execution order.
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            stages,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }

    /// Sets how many records are processed between cancellation checks.
    #[must_use]
    pub fn with_cancel_check_interval(mut self, interval: usize) -> Self {
        self.cancel_check_interval = interval.max(1);
        self
    }

    /// The configured stages.
    #[must_use]
    pub fn stages(&self) -> &[Arc<dyn Processor>] {
        &self.stages
    }

    /// Runs a batch through every stage.
    ///
    /// The batch is fed in chunks of `cancel_check_interval` records and the
    /// token is checked between chunks, so every returned record has passed
    /// every stage even when the batch is cancelled. Stages never see the
    /// caller's token.
    #[instrument(skip_all, fields(batch_len = batch.len()))]
    pub fn process(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome {
        let total = batch.len();
        let mut admitted = Vec::with_capacity(total);
        let mut input = batch.into_iter();
        let mut consumed = 0;
        let uncancelled = CancellationToken::new();

        while consumed < total {
            if consumed > 0 && cancel.is_cancelled() {
                debug!(consumed, total, "batch cancelled");
                return BatchOutcome::partial(admitted, total - consumed);
            }
            let chunk: Vec<_> = input.by_ref().take(self.cancel_check_interval).collect();
            consumed += chunk.len();
            admitted.append(&mut self.run_stages(chunk, &uncancelled));
        }
        BatchOutcome::complete(admitted)
    }

    fn run_stages(&self, mut records: Vec<TelemetryRecord>, cancel: &CancellationToken) -> Vec<TelemetryRecord> {
        for stage in &self.stages {
            if records.is_empty() {
                break;
            }
            records = stage.process_batch(records, cancel).records;
        }
        records
    }

    /// Runs housekeeping on every stage.
    pub fn housekeep(&self) {
        for stage in &self.stages {
            stage.housekeep();
        }
    }

    /// Flushes pending self-telemetry of every stage.
    pub fn flush_telemetry(&self) {
        for stage in &self.stages {
            stage.flush_telemetry();
        }
    }

    /// Per-stage snapshots keyed by stage name.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let stages: serde_json::Map<_, _> = self
            .stages
            .iter()
            .map(|s| (s.name().to_string(), s.snapshot()))
            .collect();
        serde_json::Value::Object(stages)
    }
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("AdmissionPipeline")
            .field("stages", &names)
            .field("cancel_check_interval", &self.cancel_check_interval)
            .finish()
    }
}
