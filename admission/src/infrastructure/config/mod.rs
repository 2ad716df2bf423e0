//! Configuration management for the admission host.
//!
//! Settings are layered: built-in defaults, then an optional file named by
//! `DBINTEL_CONFIG` (any format the `config` crate understands), then
//! environment variables of the form `DBINTEL__SECTION__KEY`.
//!
//! # Example
//!
//! ```no_run
//! use dbintel_admission::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! ```

pub mod pipeline;
pub mod server;
pub mod telemetry;

pub use pipeline::PipelineSettings;
pub use server::ServerSettings;
pub use telemetry::TelemetrySettings;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::SharedClock;
use crate::cost::{CostControl, CostControlConfig};
use crate::pipeline::{AdmissionPipeline, Processor};
use crate::sampler::{AdaptiveSampler, SamplerConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Environment variable naming an optional configuration file.
pub const CONFIG_FILE_ENV: &str = "DBINTEL_CONFIG";

/// Top-level configuration for the admission host.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Server settings.
    pub server: ServerSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Pipeline host settings.
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Adaptive sampler settings.
    #[serde(default)]
    pub sampler: SamplerConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Cost control settings.
    #[serde(default)]
    pub cost_control: CostControlConfig,
}

impl Settings {
    /// Loads settings from defaults, the file named by `DBINTEL_CONFIG` (if
    /// set) and `DBINTEL__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load(file.as_deref().map(Path::new))
    }

    /// Loads settings with an explicit configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed, or if a value
    /// has the wrong type.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 9464)?
            .set_default("telemetry.service_name", "dbintel-admission")?
            .set_default("telemetry.sampling_ratio", 1.0)?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix("DBINTEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Builds the enabled stages in execution order: sampler, circuit
    /// breaker, cost control.
    #[must_use]
    pub fn build_stages(&self, clock: &SharedClock) -> Vec<Arc<dyn Processor>> {
        let mut stages: Vec<Arc<dyn Processor>> = Vec::with_capacity(3);
        if self.pipeline.sampler_enabled {
            let sampler = AdaptiveSampler::new(self.sampler.clone(), Arc::clone(clock))
                .with_housekeeping_interval(self.pipeline.housekeeping_interval());
            stages.push(Arc::new(sampler));
        }
        if self.pipeline.circuit_breaker_enabled {
            stages.push(Arc::new(CircuitBreaker::new(
                self.circuit_breaker.clone(),
                Arc::clone(clock),
            )));
        }
        if self.pipeline.cost_control_enabled {
            stages.push(Arc::new(CostControl::new(self.cost_control.clone(), Arc::clone(clock))));
        }
        stages
    }

    /// Builds the pipeline from the enabled stages.
    #[must_use]
    pub fn build_pipeline(&self, clock: &SharedClock) -> AdmissionPipeline {
        AdmissionPipeline::new(self.build_stages(clock))
            .with_cancel_check_interval(self.pipeline.cancel_check_interval)
    }
}

/// Helper for strong typing addresses
pub struct BindAddress(pub String, pub u16);

impl BindAddress {
    /// Converts the bind address to a `SocketAddr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the IP address string cannot be parsed.
    pub fn to_socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let ip = self
            .0
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid IP address '{}': {e}", self.0))?;
        Ok(std::net::SocketAddr::new(ip, self.1))
    }
}

impl From<&ServerSettings> for BindAddress {
    fn from(server: &ServerSettings) -> Self {
        Self(server.host.clone(), server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use std::io::Write;

    #[test]
    fn test_defaults_build_all_stages() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.server.port, 9464);
        assert_eq!(settings.telemetry.log_level, "info");
        assert_eq!(settings.sampler, SamplerConfig::default());

        let pipeline = settings.build_pipeline(&MonotonicClock::shared());
        let names: Vec<_> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["adaptive_sampler", "circuit_breaker", "cost_control"]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
circuit_breaker_enabled = false

[sampler]
default_target_rate = 25.0

[sampler.target_rates]
query_metrics = 5.0

[cost_control]
default_ceiling = 50

[cost_control.tenant_ceilings]
free = 0
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert!((settings.sampler.target_for("query_metrics") - 5.0).abs() < f64::EPSILON);
        assert!((settings.sampler.target_for("other") - 25.0).abs() < f64::EPSILON);
        assert_eq!(settings.cost_control.ceiling_for("free"), 0);
        assert_eq!(settings.cost_control.ceiling_for("acme"), 50);

        let stages = settings.build_stages(&MonotonicClock::shared());
        assert_eq!(stages.len(), 2);
    }

    #[test]
    fn test_sampler_rules_and_housekeeping_interval_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
housekeeping_interval_ms = 120000

[sampler]
state_ttl_secs = 60

[[sampler.rules]]
name = "slow"
priority = 100
sample_rate = 1.0

[[sampler.rules.conditions]]
attribute = "db.query.duration_ms"
operator = "gt"
value = 1000
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.sampler.rules.len(), 1);
        assert_eq!(settings.sampler.rules[0].conditions.len(), 1);
        assert!(settings.sampler.validate().is_ok());

        let stages = settings.build_stages(&MonotonicClock::shared());
        assert_eq!(stages[0].name(), "adaptive_sampler");
        assert_eq!(stages[0].snapshot()["pass_through"], true);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/dbintel.toml"))).is_err());
    }

    #[test]
    fn test_bind_address() {
        let addr = BindAddress("127.0.0.1".into(), 9464).to_socket_addr().unwrap();
        assert_eq!(addr.port(), 9464);
        assert!(BindAddress("not-an-ip".into(), 1).to_socket_addr().is_err());
    }
}
