//! Pipeline host settings: which stages run and how batches are fed.

use crate::housekeeping::DEFAULT_HOUSEKEEPING_INTERVAL;
use crate::pipeline::DEFAULT_CANCEL_CHECK_INTERVAL;
use serde::Deserialize;
use std::time::Duration;

/// Settings of the pipeline host.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Run the adaptive sampler (default: true)
    #[serde(default = "default_true")]
    pub sampler_enabled: bool,

    /// Run the circuit breaker (default: true)
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Run cost control (default: true)
    #[serde(default = "default_true")]
    pub cost_control_enabled: bool,

    /// Maximum records read from input per batch (default: 512)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds a partial batch waits for more input before it is
    /// processed anyway (default: 200)
    #[serde(default = "default_batch_linger_ms")]
    pub batch_linger_ms: u64,

    /// Housekeeping tick in milliseconds (default: 1000)
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,

    /// Records processed between cancellation checks (default: 256)
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sampler_enabled: default_true(),
            circuit_breaker_enabled: default_true(),
            cost_control_enabled: default_true(),
            batch_size: default_batch_size(),
            batch_linger_ms: default_batch_linger_ms(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            cancel_check_interval: default_cancel_check_interval(),
        }
    }
}

impl PipelineSettings {
    /// Maximum wait of a partial batch.
    #[must_use]
    pub const fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }

    /// Housekeeping tick.
    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    512
}

fn default_batch_linger_ms() -> u64 {
    200
}

fn default_housekeeping_interval_ms() -> u64 {
    DEFAULT_HOUSEKEEPING_INTERVAL.as_secs() * 1000
}

fn default_cancel_check_interval() -> usize {
    DEFAULT_CANCEL_CHECK_INTERVAL
}
