//! Adaptive sampler configuration.

use super::rules::SamplingRule;
use crate::error::ConfigError;
use crate::housekeeping::DEFAULT_HOUSEKEEPING_INTERVAL;
use crate::pipeline::DEFAULT_CANCEL_CHECK_INTERVAL;
use crate::record::keys;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const STAGE: &str = "adaptive_sampler";

/// Settings for the adaptive sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Target admitted rate (records/s) for categories without an override (default: 100)
    #[serde(default = "default_target_rate")]
    pub default_target_rate: f64,

    /// Per-category target rates in records/s
    #[serde(default)]
    pub target_rates: HashMap<String, f64>,

    /// Categories admitted unconditionally (default: `["errors"]`)
    #[serde(default = "default_always_sample")]
    pub always_sample: Vec<String>,

    /// Admit error records regardless of category (default: true)
    #[serde(default = "default_true")]
    pub always_sample_errors: bool,

    /// EWMA smoothing factor in (0, 1] (default: 0.3)
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// Relative band around the target inside which probability is left alone (default: 0.1)
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,

    /// Largest relative probability change per window (default: 0.5)
    #[serde(default = "default_max_adjustment")]
    pub max_adjustment: f64,

    /// Probability floor for categories with a non-zero target (default: 0.0001)
    #[serde(default = "default_min_probability")]
    pub min_probability: f64,

    /// Probability applied to records without an entity key (default: 0.1)
    #[serde(default = "default_fallback_probability")]
    pub fallback_probability: f64,

    /// Maximum number of tracked categories (default: 1024)
    #[serde(default = "default_max_categories")]
    pub max_categories: usize,

    /// Idle seconds after which a category's state is dropped (default: 600)
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,

    /// Records processed between cancellation checks (default: 256)
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,

    /// Duplicate suppression by plan hash
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Attribute rules evaluated ahead of the category probability
    #[serde(default)]
    pub rules: Vec<SamplingRule>,
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Enable duplicate suppression (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of remembered hashes (default: 10000)
    #[serde(default = "default_dedup_cache_size")]
    pub cache_size: usize,

    /// Seconds a hash is remembered (default: 300)
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,

    /// Attribute carrying the hash (default: `db.query.plan.hash`)
    #[serde(default = "default_hash_attribute")]
    pub hash_attribute: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_target_rate: default_target_rate(),
            target_rates: HashMap::new(),
            always_sample: default_always_sample(),
            always_sample_errors: default_true(),
            ewma_alpha: default_ewma_alpha(),
            hysteresis: default_hysteresis(),
            max_adjustment: default_max_adjustment(),
            min_probability: default_min_probability(),
            fallback_probability: default_fallback_probability(),
            max_categories: default_max_categories(),
            state_ttl_secs: default_state_ttl_secs(),
            cancel_check_interval: default_cancel_check_interval(),
            dedup: DedupConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_size: default_dedup_cache_size(),
            window_secs: default_dedup_window_secs(),
            hash_attribute: default_hash_attribute(),
        }
    }
}

impl SamplerConfig {
    /// Sets the target rate for one category.
    #[must_use]
    pub fn with_target_rate(mut self, category: impl Into<String>, rate: f64) -> Self {
        self.target_rates.insert(category.into(), rate);
        self
    }

    /// Sets the default target rate.
    #[must_use]
    pub const fn with_default_target_rate(mut self, rate: f64) -> Self {
        self.default_target_rate = rate;
        self
    }

    /// Target rate for `category`.
    #[must_use]
    pub fn target_for(&self, category: &str) -> f64 {
        self.target_rates
            .get(category)
            .copied()
            .unwrap_or(self.default_target_rate)
    }

    /// Returns `true` if `category` bypasses sampling.
    #[must_use]
    pub fn is_always_sampled(&self, category: &str) -> bool {
        self.always_sample.iter().any(|c| c == category)
    }

    /// Adds a sampling rule.
    #[must_use]
    pub fn with_rule(mut self, rule: SamplingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Idle TTL of per-category state.
    #[must_use]
    pub const fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    /// Checks every setting against the default housekeeping interval.
    ///
    /// # Errors
    ///
    /// Returns the first setting found outside its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with_tick(DEFAULT_HOUSEKEEPING_INTERVAL)
    }

    /// Checks every setting. Category state must outlive one housekeeping
    /// `tick`, or each window closes on a freshly recreated state.
    ///
    /// # Errors
    ///
    /// Returns the first setting found outside its valid range.
    pub fn validate_with_tick(&self, tick: Duration) -> Result<(), ConfigError> {
        check_rate("default_target_rate", self.default_target_rate)?;
        for rate in self.target_rates.values() {
            check_rate("target_rates", *rate)?;
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::out_of_range(STAGE, "ewma_alpha", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.hysteresis) {
            return Err(ConfigError::out_of_range(STAGE, "hysteresis", "must be in [0, 1)"));
        }
        if !(self.max_adjustment > 0.0 && self.max_adjustment < 1.0) {
            return Err(ConfigError::out_of_range(STAGE, "max_adjustment", "must be in (0, 1)"));
        }
        check_probability("min_probability", self.min_probability)?;
        check_probability("fallback_probability", self.fallback_probability)?;
        if self.max_categories == 0 {
            return Err(ConfigError::out_of_range(STAGE, "max_categories", "must be positive"));
        }
        if self.state_ttl_secs == 0 {
            return Err(ConfigError::out_of_range(STAGE, "state_ttl_secs", "must be positive"));
        }
        if self.state_ttl() <= tick {
            return Err(ConfigError::out_of_range(
                STAGE,
                "state_ttl_secs",
                format!("{}s must exceed the housekeeping interval of {tick:?}", self.state_ttl_secs),
            ));
        }
        if self.dedup.enabled {
            if self.dedup.cache_size == 0 {
                return Err(ConfigError::out_of_range(STAGE, "dedup.cache_size", "must be positive"));
            }
            if self.dedup.window_secs == 0 {
                return Err(ConfigError::out_of_range(STAGE, "dedup.window_secs", "must be positive"));
            }
            if self.dedup.hash_attribute.is_empty() {
                return Err(ConfigError::out_of_range(STAGE, "dedup.hash_attribute", "must not be empty"));
            }
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

fn check_rate(field: &'static str, rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(STAGE, field, format!("{rate} is not a finite rate >= 0")))
    }
}

fn check_probability(field: &'static str, p: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(STAGE, field, format!("{p} is not in [0, 1]")))
    }
}

fn default_target_rate() -> f64 {
    100.0
}

fn default_always_sample() -> Vec<String> {
    vec!["errors".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_hysteresis() -> f64 {
    0.1
}

fn default_max_adjustment() -> f64 {
    0.5
}

fn default_min_probability() -> f64 {
    1e-4
}

fn default_fallback_probability() -> f64 {
    0.1
}

fn default_max_categories() -> usize {
    1024
}

fn default_state_ttl_secs() -> u64 {
    600
}

fn default_cancel_check_interval() -> usize {
    DEFAULT_CANCEL_CHECK_INTERVAL
}

fn default_dedup_cache_size() -> usize {
    10_000
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_hash_attribute() -> String {
    keys::PLAN_HASH.to_string()
}
