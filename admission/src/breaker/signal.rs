//! Success/failure classification of records.

use super::config::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::record::{keys, TelemetryRecord};
use regex::RegexSet;

/// Outcome a record reports about its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Nothing wrong.
    Success,
    /// Hard or soft failure.
    Failure(FailureKind),
}

/// Why a record counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `db.error` flag or an error-level log.
    ErrorFlag,
    /// `error.message` matched a configured pattern.
    ErrorPattern,
    /// Query duration above the latency threshold.
    Latency,
}

impl Signal {
    /// Returns `true` for failures.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// Derives a [`Signal`] from record attributes.
#[derive(Debug, Clone)]
pub struct SignalClassifier {
    patterns: RegexSet,
    latency_threshold_ms: f64,
}

impl SignalClassifier {
    /// Compiles the configured error patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] naming the first bad pattern.
    pub fn new(config: &CircuitBreakerConfig) -> Result<Self, ConfigError> {
        let case_insensitive: Vec<String> = config.error_patterns.iter().map(|p| format!("(?i){p}")).collect();
        let patterns = RegexSet::new(&case_insensitive).map_err(|e| {
            let pattern = config
                .error_patterns
                .iter()
                .find(|p| regex::Regex::new(p).is_err())
                .cloned()
                .unwrap_or_default();
            ConfigError::InvalidPattern {
                stage: "circuit_breaker",
                pattern,
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            patterns,
            latency_threshold_ms: config.latency_threshold_ms,
        })
    }

    /// Classifies one record.
    #[must_use]
    pub fn classify(&self, record: &TelemetryRecord) -> Signal {
        if record.is_error() {
            return Signal::Failure(FailureKind::ErrorFlag);
        }
        if let Some(message) = record.attributes.get_non_empty(keys::ERROR_MESSAGE) {
            if self.patterns.is_match(message) {
                return Signal::Failure(FailureKind::ErrorPattern);
            }
        }
        match record.attributes.get_f64(keys::QUERY_DURATION_MS) {
            Some(ms) if ms > self.latency_threshold_ms => Signal::Failure(FailureKind::Latency),
            _ => Signal::Success,
        }
    }
}
