//! Logging and trace export settings.

use serde::Deserialize;
use std::time::Duration;

/// Telemetry configuration settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// Service name for telemetry.
    pub service_name: String,
    /// OTLP endpoint for traces.
    pub otlp_endpoint: Option<String>,
    /// Sampling ratio for traces.
    #[serde(default = "default_sampling")]
    pub sampling_ratio: f64,
    /// Default log filter, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds after which an unchanged counter or gauge series is dropped
    /// from `/metrics`; 0 keeps every series forever (default: 300).
    #[serde(default = "default_metrics_idle_timeout_secs")]
    pub metrics_idle_timeout_secs: u64,
}

impl TelemetrySettings {
    /// Idle timeout for exported metric series, if enabled.
    #[must_use]
    pub fn metrics_idle_timeout(&self) -> Option<Duration> {
        (self.metrics_idle_timeout_secs > 0).then(|| Duration::from_secs(self.metrics_idle_timeout_secs))
    }
}

pub(super) fn default_sampling() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_idle_timeout_secs() -> u64 {
    300
}
