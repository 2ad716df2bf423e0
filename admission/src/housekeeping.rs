//! Background maintenance for the admission stages.
//!
//! Each stage gets its own tokio interval task that calls
//! [`Processor::housekeep`] and [`Processor::flush_telemetry`]. A slow stage
//! never delays another stage's window rollover or recovery timers.

use crate::pipeline::Processor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default tick period.
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the housekeeping tasks of a set of stages.
pub struct Housekeeper {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stages: Vec<Arc<dyn Processor>>,
}

impl Housekeeper {
    /// Spawns one interval task per stage on the current tokio runtime.
    ///
    /// The first tick fires one `period` after spawning. Missed ticks are
    /// skipped rather than replayed in a burst.
    #[must_use]
    pub fn spawn(stages: &[Arc<dyn Processor>], period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let period = period.max(Duration::from_millis(1));
        let tasks = stages
            .iter()
            .map(|stage| tokio::spawn(run_stage(Arc::clone(stage), period, cancel.child_token())))
            .collect();
        info!(stages = stages.len(), ?period, "housekeeping started");
        Self {
            cancel,
            tasks,
            stages: stages.to_vec(),
        }
    }

    /// Token that stops every task when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops every task, waits for them, and flushes pending self-telemetry.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "housekeeping task ended abnormally");
            }
        }
        for stage in &self.stages {
            stage.flush_telemetry();
        }
        info!("housekeeping stopped");
    }
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper")
            .field("tasks", &self.tasks.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn run_stage(stage: Arc<dyn Processor>, period: Duration, cancel: CancellationToken) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                stage.housekeep();
                stage.flush_telemetry();
            }
        }
    }
    debug!(stage = stage.name(), "housekeeping task exiting");
}
