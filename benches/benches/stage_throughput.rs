//! Benchmarks for batch admission through each stage and the full pipeline
//!
//! Performance-critical paths:
//! - `AdaptiveSampler::process_batch`: category lookup and keyed decision
//! - `CircuitBreaker::process_batch`: classification and state-machine update
//! - `CostControl::process_batch`: signature hashing and overflow coalescing
//! - `AdmissionPipeline::process`: all three in sequence

#![allow(missing_docs)]

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dbintel_admission::breaker::{CircuitBreaker, CircuitBreakerConfig};
use dbintel_admission::clock::ManualClock;
use dbintel_admission::cost::{CostControl, CostControlConfig};
use dbintel_admission::pipeline::{AdmissionPipeline, Processor};
use dbintel_admission::record::{Attributes, Payload, TelemetryRecord, keys};
use dbintel_admission::sampler::{AdaptiveSampler, SamplerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const BATCH: usize = 512;

/// Batch spread over 32 databases, 8 categories and 256 users of 4 tenants.
fn batch() -> Vec<TelemetryRecord> {
    (0..BATCH)
        .map(|i| {
            let db = format!("db{}", i % 32);
            let category = format!("c{}", i % 8);
            let fingerprint = format!("q{}", i % 97);
            let tenant = format!("t{}", i % 4);
            let user = (i % 256).to_string();
            let attributes: Attributes = [
                (keys::DB_NAME, db.as_str()),
                (keys::CATEGORY, category.as_str()),
                (keys::QUERY_FINGERPRINT, fingerprint.as_str()),
                (keys::TENANT, tenant.as_str()),
                ("user.id", user.as_str()),
            ]
            .into_iter()
            .collect();
            TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, attributes)
        })
        .collect()
}

fn stages() -> Vec<(&'static str, Arc<dyn Processor>)> {
    let clock = ManualClock::new();
    vec![
        (
            "sampler",
            Arc::new(AdaptiveSampler::new(SamplerConfig::default(), clock.clone())) as Arc<dyn Processor>,
        ),
        (
            "breaker",
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone())) as Arc<dyn Processor>,
        ),
        (
            "cost",
            Arc::new(CostControl::new(
                CostControlConfig::default().with_default_ceiling(64),
                clock,
            )) as Arc<dyn Processor>,
        ),
    ]
}

fn bench_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage/process_batch");
    group.throughput(Throughput::Elements(BATCH as u64));
    let input = batch();
    let cancel = CancellationToken::new();

    for (name, stage) in stages() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &stage, |b, stage| {
            b.iter_batched(
                || input.clone(),
                |records| black_box(stage.process_batch(records, &cancel)),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline/process");
    group.throughput(Throughput::Elements(BATCH as u64));
    let pipeline = AdmissionPipeline::new(stages().into_iter().map(|(_, s)| s).collect());
    let input = batch();
    let cancel = CancellationToken::new();

    group.bench_function("three_stages", |b| {
        b.iter_batched(
            || input.clone(),
            |records| black_box(pipeline.process(records, &cancel)),
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_stages, bench_pipeline);
criterion_main!(benches);
