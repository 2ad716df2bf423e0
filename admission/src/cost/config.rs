//! Cost control configuration.

use crate::error::ConfigError;
use crate::pipeline::DEFAULT_CANCEL_CHECK_INTERVAL;
use crate::record::keys;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const STAGE: &str = "cost_control";

/// Tenant used when a record does not carry the tenant attribute.
pub const DEFAULT_TENANT: &str = "default";

/// Settings for the cost control stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostControlConfig {
    /// Distinct signatures per tenant and window (default: 10000). Zero or
    /// negative disables cost control for tenants without an override.
    #[serde(default = "default_ceiling")]
    pub default_ceiling: i64,

    /// Per-tenant ceilings
    #[serde(default)]
    pub tenant_ceilings: HashMap<String, i64>,

    /// Attribute naming the tenant (default: `tenant.id`)
    #[serde(default = "default_tenant_attribute")]
    pub tenant_attribute: String,

    /// Attributes whose values make up a record's signature
    #[serde(default = "default_high_cardinality_attributes")]
    pub high_cardinality_attributes: Vec<String>,

    /// Rolling window in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Maximum number of tracked tenants (default: 1024)
    #[serde(default = "default_max_tenants")]
    pub max_tenants: usize,

    /// Idle seconds after which a tenant's budget is forgotten (default: 3600)
    #[serde(default = "default_tenant_ttl_secs")]
    pub tenant_ttl_secs: u64,

    /// Log bodies longer than this many bytes are truncated; 0 disables (default: 10240)
    #[serde(default = "default_max_log_body_bytes")]
    pub max_log_body_bytes: usize,

    /// Records processed between cancellation checks (default: 256)
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,

    /// Log a volume report for every tenant window that saw traffic (default: false)
    #[serde(default)]
    pub report_windows: bool,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            default_ceiling: default_ceiling(),
            tenant_ceilings: HashMap::new(),
            tenant_attribute: default_tenant_attribute(),
            high_cardinality_attributes: default_high_cardinality_attributes(),
            window_secs: default_window_secs(),
            max_tenants: default_max_tenants(),
            tenant_ttl_secs: default_tenant_ttl_secs(),
            max_log_body_bytes: default_max_log_body_bytes(),
            cancel_check_interval: default_cancel_check_interval(),
            report_windows: false,
        }
    }
}

impl CostControlConfig {
    /// Sets the default ceiling.
    #[must_use]
    pub fn with_default_ceiling(mut self, ceiling: i64) -> Self {
        self.default_ceiling = ceiling;
        self
    }

    /// Sets the ceiling of one tenant.
    #[must_use]
    pub fn with_tenant_ceiling(mut self, tenant: impl Into<String>, ceiling: i64) -> Self {
        self.tenant_ceilings.insert(tenant.into(), ceiling);
        self
    }

    /// Replaces the signature attributes.
    #[must_use]
    pub fn with_high_cardinality_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.high_cardinality_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Ceiling that applies to `tenant`.
    #[must_use]
    pub fn ceiling_for(&self, tenant: &str) -> i64 {
        self.tenant_ceilings
            .get(tenant)
            .copied()
            .unwrap_or(self.default_ceiling)
    }

    /// Rolling window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Idle TTL of a tenant budget.
    #[must_use]
    pub const fn tenant_ttl(&self) -> Duration {
        Duration::from_secs(self.tenant_ttl_secs)
    }

    /// Checks sizes and durations. Non-positive ceilings are not errors.
    ///
    /// # Errors
    ///
    /// Returns the first setting found outside its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs == 0 {
            return Err(ConfigError::out_of_range(STAGE, "window_secs", "must be positive"));
        }
        if self.max_tenants == 0 {
            return Err(ConfigError::out_of_range(STAGE, "max_tenants", "must be positive"));
        }
        if self.tenant_ttl_secs < self.window_secs {
            return Err(ConfigError::out_of_range(
                STAGE,
                "tenant_ttl_secs",
                "must be at least window_secs",
            ));
        }
        if self.tenant_attribute.is_empty() {
            return Err(ConfigError::out_of_range(STAGE, "tenant_attribute", "must not be empty"));
        }
        Ok(())
    }
}

fn default_ceiling() -> i64 {
    10_000
}

fn default_tenant_attribute() -> String {
    keys::TENANT.to_string()
}

fn default_high_cardinality_attributes() -> Vec<String> {
    [
        "user.id",
        "session.id",
        "request.id",
        "trace.id",
        "span.id",
        "http.request.id",
        "transaction.id",
        "correlation.id",
        "client.address",
        "client.socket.address",
        "net.peer.ip",
        "http.user_agent",
        "user_agent.original",
        keys::QUERY_FINGERPRINT,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_tenants() -> usize {
    1024
}

fn default_tenant_ttl_secs() -> u64 {
    3600
}

fn default_max_log_body_bytes() -> usize {
    10_240
}

fn default_cancel_check_interval() -> usize {
    DEFAULT_CANCEL_CHECK_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: CostControlConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, CostControlConfig::default());
        assert_eq!(cfg.ceiling_for("anyone"), 10_000);
        assert!(cfg.high_cardinality_attributes.iter().any(|a| a == "session.id"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_tenant_override() {
        let cfg = CostControlConfig::default().with_tenant_ceiling("acme", 50);
        assert_eq!(cfg.ceiling_for("acme"), 50);
        assert_eq!(cfg.ceiling_for("globex"), 10_000);
    }

    #[test]
    fn test_non_positive_ceiling_is_not_a_validation_error() {
        let cfg = CostControlConfig::default().with_default_ceiling(0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_window() {
        let mut cfg = CostControlConfig::default();
        cfg.window_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
