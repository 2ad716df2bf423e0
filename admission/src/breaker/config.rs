//! Circuit breaker configuration.

use crate::error::ConfigError;
use crate::pipeline::DEFAULT_CANCEL_CHECK_INTERVAL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const STAGE: &str = "circuit_breaker";

/// Default failure threshold before a circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default failure counting window in milliseconds
pub const DEFAULT_WINDOW_MS: u64 = 30_000;
/// Default first recovery timeout in milliseconds
pub const DEFAULT_BASE_RECOVERY_MS: u64 = 30_000;
/// Default recovery timeout ceiling in milliseconds
pub const DEFAULT_MAX_RECOVERY_MS: u64 = 600_000;
/// Default number of probes admitted while half-open
pub const DEFAULT_HALF_OPEN_MAX_PROBES: u32 = 1;
/// Default number of successful probes needed to close
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
/// Default latency above which a record counts as a soft failure
pub const DEFAULT_LATENCY_THRESHOLD_MS: f64 = 5_000.0;
/// Default maximum number of tracked entities
pub const DEFAULT_MAX_ENTITIES: usize = 4096;
/// Default idle seconds before an entity's circuit is forgotten
pub const DEFAULT_ENTITY_TTL_SECS: u64 = 3600;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window that opens the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failure counting window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// First recovery timeout in milliseconds
    #[serde(default = "default_base_recovery_ms")]
    pub base_recovery_ms: u64,
    /// Ceiling for the doubled recovery timeout in milliseconds
    #[serde(default = "default_max_recovery_ms")]
    pub max_recovery_ms: u64,
    /// Maximum number of probe records admitted while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
    /// Successful probes required to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Query duration above which a record is a soft failure
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: f64,
    /// Case-insensitive regexes matched against `error.message`
    #[serde(default = "default_error_patterns")]
    pub error_patterns: Vec<String>,
    /// Maximum number of tracked entities
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    /// Idle seconds after which an entity's circuit is forgotten
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,
    /// Records processed between cancellation checks
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
}

impl CircuitBreakerConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window_ms: DEFAULT_WINDOW_MS,
            base_recovery_ms: DEFAULT_BASE_RECOVERY_MS,
            max_recovery_ms: DEFAULT_MAX_RECOVERY_MS,
            half_open_max_probes: DEFAULT_HALF_OPEN_MAX_PROBES,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
            error_patterns: default_error_patterns(),
            max_entities: DEFAULT_MAX_ENTITIES,
            entity_ttl_secs: DEFAULT_ENTITY_TTL_SECS,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the failure window in milliseconds.
    #[must_use]
    pub const fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    /// Sets the base and maximum recovery timeouts in milliseconds.
    #[must_use]
    pub const fn with_recovery_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_recovery_ms = base_ms;
        self.max_recovery_ms = max_ms;
        self
    }

    /// Sets the half-open probe quota.
    #[must_use]
    pub const fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes;
        self
    }

    /// Sets the successful probes needed to close.
    #[must_use]
    pub const fn with_success_threshold(mut self, successes: u32) -> Self {
        self.success_threshold = successes;
        self
    }

    /// Sets the soft-failure latency threshold.
    #[must_use]
    pub const fn with_latency_threshold_ms(mut self, threshold_ms: f64) -> Self {
        self.latency_threshold_ms = threshold_ms;
        self
    }

    /// Sets the idle TTL of an entity in seconds.
    #[must_use]
    pub const fn with_entity_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.entity_ttl_secs = ttl_secs;
        self
    }

    /// Failure counting window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// First recovery timeout.
    #[must_use]
    pub const fn base_recovery(&self) -> Duration {
        Duration::from_millis(self.base_recovery_ms)
    }

    /// Recovery timeout ceiling.
    #[must_use]
    pub const fn max_recovery(&self) -> Duration {
        Duration::from_millis(self.max_recovery_ms)
    }

    /// Idle TTL of an entity.
    #[must_use]
    pub const fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }

    /// Checks thresholds and durations. Patterns are checked when compiled.
    ///
    /// # Errors
    ///
    /// Returns the first setting found outside its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::out_of_range(STAGE, "failure_threshold", "must be positive"));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::out_of_range(STAGE, "window_ms", "must be positive"));
        }
        if self.base_recovery_ms == 0 {
            return Err(ConfigError::out_of_range(STAGE, "base_recovery_ms", "must be positive"));
        }
        if self.max_recovery_ms < self.base_recovery_ms {
            return Err(ConfigError::out_of_range(
                STAGE,
                "max_recovery_ms",
                format!("{} is below base_recovery_ms {}", self.max_recovery_ms, self.base_recovery_ms),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::out_of_range(STAGE, "success_threshold", "must be positive"));
        }
        if self.half_open_max_probes < self.success_threshold {
            return Err(ConfigError::out_of_range(
                STAGE,
                "half_open_max_probes",
                "must be at least success_threshold",
            ));
        }
        if self.latency_threshold_ms.is_nan() || self.latency_threshold_ms <= 0.0 {
            return Err(ConfigError::out_of_range(STAGE, "latency_threshold_ms", "must be positive"));
        }
        if self.max_entities == 0 {
            return Err(ConfigError::out_of_range(STAGE, "max_entities", "must be positive"));
        }
        // An open circuit must outlive its longest recovery timer and a
        // closed one its failure window.
        let ttl_ms = self.entity_ttl_secs.saturating_mul(1000);
        if ttl_ms <= self.max_recovery_ms || ttl_ms <= self.window_ms {
            return Err(ConfigError::out_of_range(
                STAGE,
                "entity_ttl_secs",
                format!(
                    "{}s must exceed max_recovery_ms {} and window_ms {}",
                    self.entity_ttl_secs, self.max_recovery_ms, self.window_ms
                ),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_base_recovery_ms() -> u64 {
    DEFAULT_BASE_RECOVERY_MS
}

fn default_max_recovery_ms() -> u64 {
    DEFAULT_MAX_RECOVERY_MS
}

fn default_half_open_max_probes() -> u32 {
    DEFAULT_HALF_OPEN_MAX_PROBES
}

fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}

fn default_latency_threshold_ms() -> f64 {
    DEFAULT_LATENCY_THRESHOLD_MS
}

fn default_max_entities() -> usize {
    DEFAULT_MAX_ENTITIES
}

fn default_entity_ttl_secs() -> u64 {
    DEFAULT_ENTITY_TTL_SECS
}

fn default_cancel_check_interval() -> usize {
    DEFAULT_CANCEL_CHECK_INTERVAL
}

fn default_error_patterns() -> Vec<String> {
    [
        "context deadline exceeded",
        "connection refused",
        "authentication failed",
        "too many connections",
        "out of memory",
        "disk full",
        "deadlock detected",
        "lock wait timeout",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.window(), Duration::from_secs(30));
        assert_eq!(config.base_recovery(), Duration::from_secs(30));
        assert_eq!(config.max_recovery(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_custom() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_window_ms(10_000)
            .with_recovery_ms(5_000, 20_000)
            .with_half_open_max_probes(2)
            .with_success_threshold(2);

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.window_ms, 10_000);
        assert_eq!(config.base_recovery_ms, 5_000);
        assert_eq!(config.half_open_max_probes, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_from_partial_json() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 3, "window_ms": 10000}"#).unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.max_entities, DEFAULT_MAX_ENTITIES);
        assert!(!config.error_patterns.is_empty());
    }

    #[test]
    fn test_circuit_breaker_config_rejects_inverted_backoff() {
        let config = CircuitBreakerConfig::new().with_recovery_ms(10_000, 1_000);
        assert!(config.validate().is_err());
        let config = CircuitBreakerConfig::new().with_success_threshold(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_circuit_breaker_config_rejects_ttl_shorter_than_recovery() {
        let config = CircuitBreakerConfig::new()
            .with_recovery_ms(30_000, 30_000)
            .with_entity_ttl_secs(10);
        assert!(config.validate().is_err());

        let config = config.with_entity_ttl_secs(30);
        assert!(config.validate().is_err());

        let config = config.with_entity_ttl_secs(31);
        assert!(config.validate().is_ok());
    }
}
