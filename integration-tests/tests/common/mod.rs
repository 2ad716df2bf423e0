//! Shared test utilities for integration tests.
//!
//! Provides a pipeline wired the way the host wires it, driven by a manual
//! clock, plus record builders for the usual telemetry shapes.

#![allow(dead_code)]

use chrono::Utc;
use dbintel_admission::breaker::{CircuitBreaker, CircuitBreakerConfig};
use dbintel_admission::clock::ManualClock;
use dbintel_admission::cost::{CostControl, CostControlConfig};
use dbintel_admission::pipeline::{AdmissionPipeline, BatchOutcome, Processor};
use dbintel_admission::record::{keys, Attributes, Payload, Severity, TelemetryRecord};
use dbintel_admission::sampler::{AdaptiveSampler, SamplerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Full three-stage pipeline with handles on each stage.
pub struct PipelineHarness {
    /// Time source shared by every stage.
    pub clock: Arc<ManualClock>,
    /// Adaptive sampler stage.
    pub sampler: Arc<AdaptiveSampler>,
    /// Circuit breaker stage.
    pub breaker: Arc<CircuitBreaker>,
    /// Cost control stage.
    pub cost: Arc<CostControl>,
    /// The pipeline running all three.
    pub pipeline: AdmissionPipeline,
}

impl PipelineHarness {
    /// Creates a harness from per-stage configuration.
    pub fn new(sampler: SamplerConfig, breaker: CircuitBreakerConfig, cost: CostControlConfig) -> Self {
        let clock = ManualClock::new();
        let sampler = Arc::new(AdaptiveSampler::new(sampler, clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(breaker, clock.clone()));
        let cost = Arc::new(CostControl::new(cost, clock.clone()));
        let pipeline = AdmissionPipeline::new(vec![
            sampler.clone() as Arc<dyn Processor>,
            breaker.clone() as Arc<dyn Processor>,
            cost.clone() as Arc<dyn Processor>,
        ]);
        Self {
            clock,
            sampler,
            breaker,
            cost,
            pipeline,
        }
    }

    /// Harness with default configuration everywhere.
    pub fn with_defaults() -> Self {
        Self::new(
            SamplerConfig::default(),
            CircuitBreakerConfig::default(),
            CostControlConfig::default(),
        )
    }

    /// Runs one batch to completion.
    pub fn run(&self, batch: Vec<TelemetryRecord>) -> Vec<TelemetryRecord> {
        self.pipeline.process(batch, &CancellationToken::new()).records
    }

    /// Runs one batch with an explicit token.
    pub fn run_with(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome {
        self.pipeline.process(batch, cancel)
    }

    /// Advances time and runs one housekeeping pass.
    pub fn tick(&self, by: Duration) {
        self.clock.advance(by);
        self.pipeline.housekeep();
    }
}

/// A query metric point for `db`.
pub fn metric(db: &str, category: &str, fingerprint: &str) -> TelemetryRecord {
    let attributes: Attributes = [
        (keys::DB_NAME, db),
        (keys::CATEGORY, category),
        (keys::QUERY_FINGERPRINT, fingerprint),
    ]
    .into_iter()
    .collect();
    TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, attributes)
}

/// A record reporting a failed scrape of `db`.
pub fn failure(db: &str, message: &str) -> TelemetryRecord {
    let attributes: Attributes = [
        (keys::DB_NAME, db),
        (keys::CATEGORY, "errors"),
        (keys::ERROR_MESSAGE, message),
    ]
    .into_iter()
    .collect();
    TelemetryRecord::new(
        Utc::now(),
        Payload::Log {
            severity: Severity::Error,
            body: message.to_string(),
        },
        attributes,
    )
}

/// A tenant-scoped metric with one high-cardinality attribute.
pub fn tenant_metric(db: &str, tenant: &str, user: u32) -> TelemetryRecord {
    let user = user.to_string();
    let attributes: Attributes = [
        (keys::DB_NAME, db),
        (keys::TENANT, tenant),
        ("user.id", user.as_str()),
    ]
    .into_iter()
    .collect();
    TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, attributes)
}

/// Sum of records represented by `records`, counting coalesced overflow.
pub fn represented(records: &[TelemetryRecord]) -> u64 {
    records
        .iter()
        .map(|r| r.attributes.get_u64(keys::COST_OVERFLOW_COUNT).unwrap_or(1))
        .sum()
}
