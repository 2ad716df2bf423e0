//! Adaptive sampler under sustained overload.

#![allow(missing_docs)]

use chrono::Utc;
use dbintel_admission::clock::ManualClock;
use dbintel_admission::pipeline::Processor;
use dbintel_admission::record::{keys, Attributes, Payload, TelemetryRecord};
use dbintel_admission::sampler::{AdaptiveSampler, SamplerConfig};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CATEGORY: &str = "query_metrics";

fn second_of_traffic(per_second: usize) -> Vec<TelemetryRecord> {
    (0..per_second)
        .map(|i| {
            let fingerprint = format!("q{i}");
            let attributes: Attributes = [
                (keys::DB_NAME, "orders"),
                (keys::CATEGORY, CATEGORY),
                (keys::QUERY_FINGERPRINT, fingerprint.as_str()),
            ]
            .into_iter()
            .collect();
            TelemetryRecord::new(Utc::now(), Payload::Sum { value: 1.0 }, attributes)
        })
        .collect()
}

#[test]
fn admitted_rate_converges_to_target() {
    let clock = ManualClock::new();
    let sampler = AdaptiveSampler::new(
        SamplerConfig::default().with_target_rate(CATEGORY, 100.0),
        clock.clone(),
    );

    let mut probabilities = Vec::new();
    let mut admitted = 0;
    for _ in 0..15 {
        admitted = sampler
            .process_batch(second_of_traffic(1_000), &CancellationToken::new())
            .records
            .len();
        clock.advance(Duration::from_secs(1));
        sampler.housekeep();
        probabilities.push(sampler.probability(CATEGORY).unwrap());
    }

    assert!(
        probabilities.windows(2).all(|w| w[1] <= w[0]),
        "probability never rises under constant overload: {probabilities:?}"
    );
    let p = *probabilities.last().unwrap();
    let expected = sampler.state_of(CATEGORY).unwrap().ewma_rate.unwrap() * p;
    assert!((90.0..=110.0).contains(&expected), "expected admitted rate {expected}");
    assert!((60..=140).contains(&admitted), "admitted {admitted} of 1000");
}

#[test]
fn underloaded_category_keeps_everything() {
    let clock = ManualClock::new();
    let sampler = AdaptiveSampler::new(SamplerConfig::default(), clock.clone());
    for _ in 0..5 {
        let out = sampler
            .process_batch(second_of_traffic(50), &CancellationToken::new())
            .records;
        assert_eq!(out.len(), 50);
        assert!(out
            .iter()
            .all(|r| r.attributes.get_f64(keys::SAMPLING_PROBABILITY) == Some(1.0)));
        clock.advance(Duration::from_secs(1));
        sampler.housekeep();
    }
}

#[test]
fn decisions_are_stable_for_a_key() {
    let clock = ManualClock::new();
    let sampler = AdaptiveSampler::new(
        SamplerConfig::default().with_target_rate(CATEGORY, 100.0),
        clock.clone(),
    );
    sampler.process_batch(second_of_traffic(1_000), &CancellationToken::new());
    clock.advance(Duration::from_secs(1));
    sampler.housekeep();

    let fingerprints = |records: Vec<TelemetryRecord>| -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.attributes.get_str(keys::QUERY_FINGERPRINT).map(str::to_owned))
            .collect()
    };
    let first = fingerprints(
        sampler
            .process_batch(second_of_traffic(1_000), &CancellationToken::new())
            .records,
    );
    let second = fingerprints(
        sampler
            .process_batch(second_of_traffic(1_000), &CancellationToken::new())
            .records,
    );
    assert_eq!(first, second);
}
