//! End-to-end admission scenarios across all three stages.

use dbintel_admission::breaker::{CircuitBreakerConfig, CircuitState};
use dbintel_admission::cost::CostControlConfig;
use dbintel_admission::pipeline::AdmissionPipeline;
use chrono::Utc;
use dbintel_admission::record::{keys, Payload, TelemetryRecord};
use dbintel_admission::sampler::SamplerConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod common;

use common::{PipelineHarness, failure, metric, represented, tenant_metric};

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig::new()
        .with_failure_threshold(3)
        .with_window_ms(10_000)
        .with_recovery_ms(5_000, 60_000)
}

/// Test that failing scrapes bypass sampling, trip the breaker, and that the
/// database recovers through a probe.
#[test]
fn test_failures_trip_and_recover() {
    let h = PipelineHarness::new(
        SamplerConfig::default().with_default_target_rate(0.0),
        fast_breaker(),
        CostControlConfig::default(),
    );

    let out = h.run((0..3).map(|_| failure("db1", "connection refused")).collect());
    assert_eq!(out.len(), 3, "error records are always sampled");
    assert_eq!(h.breaker.state_of("db1"), Some(CircuitState::Open));

    let out = h.run(vec![metric("db1", "errors", "q1")]);
    assert!(out.is_empty());
    assert_eq!(h.breaker.stats().dropped, 1);

    h.tick(Duration::from_secs(5));
    assert_eq!(h.breaker.state_of("db1"), Some(CircuitState::HalfOpen));

    let out = h.run(vec![metric("db1", "errors", "q1")]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].attributes.get_str(keys::CIRCUIT_STATE), Some("half_open"));
    assert_eq!(h.breaker.state_of("db1"), Some(CircuitState::Closed));
}

/// Test that every admitted record carries the decision markers of the
/// stages it passed.
#[test]
fn test_admitted_records_carry_markers() {
    let h = PipelineHarness::with_defaults();
    let out = h.run((0..20).map(|i| metric("orders", "query_metrics", &format!("q{i}"))).collect());

    assert_eq!(out.len(), 20);
    for record in &out {
        assert_eq!(record.attributes.get_f64(keys::SAMPLING_PROBABILITY), Some(1.0));
        assert_eq!(record.attributes.get_str(keys::CIRCUIT_STATE), Some("closed"));
        assert!(!record.attributes.contains(keys::COST_OVERFLOW));
    }
}

/// Test that records shed by the breaker never reach cost control, and that
/// cost control accounts for every record it does see.
#[test]
fn test_cost_accounts_for_what_the_breaker_admits() {
    let h = PipelineHarness::new(
        SamplerConfig::default(),
        fast_breaker(),
        CostControlConfig::default().with_tenant_ceiling("acme", 10),
    );

    h.run((0..3).map(|_| failure("down", "too many connections")).collect());
    assert_eq!(h.breaker.state_of("down"), Some(CircuitState::Open));

    let mut batch: Vec<_> = (0..30).map(|u| tenant_metric("orders", "acme", u)).collect();
    batch.extend((0..15).map(|u| tenant_metric("down", "acme", 100 + u)));
    let out = h.run(batch);

    assert_eq!(represented(&out), 30);
    assert_eq!(out.len(), 11);
    let snapshot = h.cost.budget_snapshot("acme").unwrap();
    assert_eq!(snapshot.total_observed, 30);
    assert_eq!(snapshot.total_retained, 10);
    assert_eq!(snapshot.total_overflow, 20);
}

/// Test that a cancelled batch returns only records that passed every stage.
#[test]
fn test_cancelled_batch_is_consistent() {
    let h = PipelineHarness::with_defaults();
    let pipeline = AdmissionPipeline::new(h.pipeline.stages().to_vec()).with_cancel_check_interval(10);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let batch = (0..50).map(|i| metric("orders", "query_metrics", &format!("q{i}"))).collect();
    let outcome = pipeline.process(batch, &cancel);

    assert!(outcome.cancelled);
    assert_eq!(outcome.unprocessed, 40);
    assert_eq!(outcome.records.len(), 10);
    assert!(outcome
        .records
        .iter()
        .all(|r| r.attributes.contains(keys::SAMPLING_PROBABILITY) && r.attributes.contains(keys::CIRCUIT_STATE)));
}

/// Test that keyed state stays within its configured bounds under unbounded
/// cardinality growth.
#[test]
fn test_state_stays_bounded() {
    let mut sampler = SamplerConfig::default();
    sampler.max_categories = 16;
    let mut breaker = CircuitBreakerConfig::default();
    breaker.max_entities = 64;
    let mut cost = CostControlConfig::default();
    cost.max_tenants = 8;
    let h = PipelineHarness::new(sampler, breaker, cost);

    for round in 0..10u32 {
        let batch = (0..500u32)
            .map(|i| {
                let n = round * 500 + i;
                let mut attributes = tenant_metric(&format!("db{n}"), &format!("t{}", n % 50), n).attributes;
                attributes.insert(keys::CATEGORY, format!("c{}", n % 100));
                TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, attributes)
            })
            .collect();
        h.run(batch);
        h.tick(Duration::from_secs(1));

        assert!(h.sampler.stats().categories.len <= 16);
        assert!(h.breaker.stats().entities.len <= 64);
        assert!(h.cost.stats().tenants.len <= 8);
    }
    assert!(h.breaker.stats().entities.evictions > 0);
    assert!(h.cost.stats().tenants.evictions > 0);
}

/// Test that the per-window overflow aggregate resets while lifetime totals
/// keep growing.
#[test]
fn test_overflow_window_rolls_over() {
    let h = PipelineHarness::new(
        SamplerConfig::default(),
        CircuitBreakerConfig::default(),
        CostControlConfig::default().with_default_ceiling(5),
    );
    h.run((0..8).map(|u| tenant_metric("orders", "acme", u)).collect());
    assert_eq!(h.cost.budget_snapshot("acme").unwrap().window_overflow, 3);

    h.tick(Duration::from_secs(60));
    let snapshot = h.cost.budget_snapshot("acme").unwrap();
    assert_eq!(snapshot.window_overflow, 0);
    assert_eq!(snapshot.total_overflow, 3);

    // Signatures idle for a full window are forgotten, freeing the budget.
    let out = h.run((100..105).map(|u| tenant_metric("orders", "acme", u)).collect());
    assert_eq!(represented(&out), 5);
    assert!(out.iter().all(|r| !r.attributes.contains(keys::COST_OVERFLOW)));
}
