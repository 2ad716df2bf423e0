//! Adaptive sampler.
//!
//! Keeps the admitted rate of each category near its target. Incoming rate is
//! smoothed per category with an EWMA at every housekeeping tick, and the
//! category's probability is moved toward `target / rate` in bounded steps.
//! Each record is admitted when the unit hash of its [`EntityKey`] falls below
//! the category probability, so a key's decision only changes when the
//! probability does.
//!
//! Configured [`SamplingRule`]s run ahead of the category probability. A
//! matching rule decides the record on its own fixed rate, and the record does
//! not count toward its category's observed rate.
//!
//! [`EntityKey`]: crate::record::EntityKey

pub mod config;
pub mod rules;
pub mod state;

pub use config::{DedupConfig, SamplerConfig};
pub use rules::{ConditionOp, ConditionValue, RuleSet, RuleStats, RuleVerdict, SamplingCondition, SamplingRule};
pub use state::{Controller, SamplingState};

use crate::clock::SharedClock;
use crate::counters::PendingCounter;
use crate::events::{log_event, AdmissionEvent};
use crate::pipeline::{BatchOutcome, CancelCheck, Processor};
use crate::record::{keys, EntityKey, TelemetryRecord};
use crate::store::{BoundedStore, EvictionReason, StoreConfig, StoreStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stage name used in logs and metrics.
pub const STAGE_NAME: &str = "adaptive_sampler";

#[derive(Debug, Default)]
struct SamplerCounters {
    sampled_in: PendingCounter,
    sampled_out: PendingCounter,
    always_sampled: PendingCounter,
    missing_key: PendingCounter,
    duplicates: PendingCounter,
    categories_evicted: PendingCounter,
}

/// Counters and state sizes of the sampler.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerStats {
    /// Records admitted by probability.
    pub sampled_in: u64,
    /// Records dropped by probability.
    pub sampled_out: u64,
    /// Records admitted unconditionally (errors, always-sample categories).
    pub always_sampled: u64,
    /// Records that carried no entity key.
    pub missing_key: u64,
    /// Records dropped as duplicates.
    pub duplicates: u64,
    /// Category state store.
    pub categories: StoreStats,
    /// Per-rule totals, in evaluation order.
    pub rules: Vec<RuleStats>,
    /// `true` when configuration was rejected.
    pub pass_through: bool,
}

enum Decision<'a> {
    Keep { probability: f64, rule: Option<&'a str> },
    Drop,
}

impl<'a> Decision<'a> {
    const ALWAYS: Self = Self::Keep {
        probability: 1.0,
        rule: None,
    };
}

/// The adaptive sampling stage.
pub struct AdaptiveSampler {
    config: SamplerConfig,
    controller: Controller,
    pass_through: bool,
    clock: SharedClock,
    states: BoundedStore<String, SamplingState>,
    dedup: Option<BoundedStore<String, ()>>,
    rules: RuleSet,
    missing_key_logged: AtomicBool,
    counters: Arc<SamplerCounters>,
}

impl AdaptiveSampler {
    /// Creates a sampler. Invalid configuration puts it in pass-through mode.
    #[must_use]
    pub fn new(config: SamplerConfig, clock: SharedClock) -> Self {
        let pass_through = match config.validate() {
            Ok(()) => false,
            Err(e) => {
                degrade(&e);
                true
            }
        };

        let counters = Arc::new(SamplerCounters::default());
        let evicted = Arc::clone(&counters);
        let states = BoundedStore::new(
            StoreConfig::new(config.max_categories).with_ttl(config.state_ttl()),
            Arc::clone(&clock),
        )
        .with_eviction_callback(Arc::new(move |category: &String, _: &SamplingState, reason| {
            if reason == EvictionReason::Capacity {
                evicted.categories_evicted.incr();
            }
            debug!(category = %category, ?reason, "sampling state released");
        }));

        let dedup = (config.dedup.enabled && !pass_through).then(|| {
            BoundedStore::new(
                StoreConfig::new(config.dedup.cache_size)
                    .with_ttl(Duration::from_secs(config.dedup.window_secs)),
                Arc::clone(&clock),
            )
        });

        let rules = RuleSet::new(config.rules.clone(), clock.now());

        let controller = Controller {
            alpha: config.ewma_alpha,
            hysteresis: config.hysteresis,
            max_adjustment: config.max_adjustment,
            min_probability: config.min_probability,
        };

        Self {
            config,
            controller,
            pass_through,
            clock,
            states,
            dedup,
            rules,
            missing_key_logged: AtomicBool::new(false),
            counters,
        }
    }

    /// Re-checks the configuration against the interval housekeeping will
    /// run at, switching to pass-through if category state would expire
    /// between ticks.
    #[must_use]
    pub fn with_housekeeping_interval(mut self, tick: Duration) -> Self {
        if !self.pass_through {
            if let Err(e) = self.config.validate_with_tick(tick) {
                degrade(&e);
                self.pass_through = true;
            }
        }
        self
    }

    /// Returns `true` if configuration was rejected.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Current probability of `category`, if it has been observed.
    #[must_use]
    pub fn probability(&self, category: &str) -> Option<f64> {
        self.states.peek(&category.to_string()).map(|s| s.probability)
    }

    /// Full state of `category`, if it has been observed.
    #[must_use]
    pub fn state_of(&self, category: &str) -> Option<SamplingState> {
        self.states.peek(&category.to_string())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        let c = &self.counters;
        SamplerStats {
            sampled_in: c.sampled_in.get(),
            sampled_out: c.sampled_out.get(),
            always_sampled: c.always_sampled.get(),
            missing_key: c.missing_key.get(),
            duplicates: c.duplicates.get(),
            categories: self.states.stats(),
            rules: self.rules.stats(),
            pass_through: self.pass_through,
        }
    }

    fn is_duplicate(&self, record: &TelemetryRecord) -> bool {
        let Some(seen) = &self.dedup else {
            return false;
        };
        match record.attributes.get_non_empty(&self.config.dedup.hash_attribute) {
            Some(hash) => !seen.insert_if_absent(hash.to_string(), ()),
            None => false,
        }
    }

    fn decide<'s>(&'s self, record: &TelemetryRecord) -> Decision<'s> {
        if self.config.always_sample_errors && record.is_error() {
            self.counters.always_sampled.incr();
            return Decision::ALWAYS;
        }
        if let Some(key) = &record.key {
            if self.config.is_always_sampled(&key.category) {
                self.counters.always_sampled.incr();
                return Decision::ALWAYS;
            }
        }
        if let Some(decision) = self.by_rule(record) {
            return decision;
        }

        let Some(key) = &record.key else {
            self.counters.missing_key.incr();
            if !self.missing_key_logged.swap(true, Ordering::Relaxed) {
                warn!(
                    stage = STAGE_NAME,
                    fallback_probability = self.config.fallback_probability,
                    "record without entity key, applying fallback probability"
                );
            }
            let p = self.config.fallback_probability;
            return self.by_probability(record.content_hash(), p);
        };

        let now = self.clock.now();
        let target = self.config.target_for(&key.category);
        let p = self.states.upsert(
            key.category.clone(),
            || SamplingState::new(target, now),
            SamplingState::observe,
        );
        self.by_probability(key.unit_hash(), p)
    }

    fn by_rule(&self, record: &TelemetryRecord) -> Option<Decision<'_>> {
        if self.rules.is_empty() {
            return None;
        }
        match self.rules.evaluate(&record.attributes, self.clock.now()) {
            RuleVerdict::NoMatch => None,
            RuleVerdict::RateLimited { .. } => Some(Decision::Drop),
            RuleVerdict::Sample { rule, rate } => {
                let hash = record
                    .key
                    .as_ref()
                    .map_or_else(|| record.content_hash(), EntityKey::unit_hash);
                let kept = hash < rate;
                self.rules.record_decision(rule, kept);
                Some(if kept {
                    Decision::Keep {
                        probability: rate,
                        rule: Some(rule),
                    }
                } else {
                    Decision::Drop
                })
            }
        }
    }

    fn by_probability(&self, hash: f64, p: f64) -> Decision<'static> {
        if hash < p {
            self.counters.sampled_in.incr();
            Decision::Keep {
                probability: p,
                rule: None,
            }
        } else {
            self.counters.sampled_out.incr();
            Decision::Drop
        }
    }
}

impl Processor for AdaptiveSampler {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn process_batch(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome {
        if self.pass_through {
            return BatchOutcome::complete(batch);
        }
        let check = CancelCheck::new(cancel, self.config.cancel_check_interval);
        let total = batch.len();
        let mut kept = Vec::with_capacity(total);

        for (index, mut record) in batch.into_iter().enumerate() {
            if check.should_stop(index) {
                return BatchOutcome::partial(kept, total - index);
            }
            record.ensure_key();
            if self.is_duplicate(&record) {
                self.counters.duplicates.incr();
                continue;
            }
            if let Decision::Keep { probability, rule } = self.decide(&record) {
                record.attributes.insert(keys::SAMPLING_PROBABILITY, probability.to_string());
                if let Some(rule) = rule {
                    record.attributes.insert(keys::SAMPLING_RULE, rule);
                }
                kept.push(record);
            }
        }
        BatchOutcome::complete(kept)
    }

    fn housekeep(&self) {
        if self.pass_through {
            return;
        }
        self.states.purge_expired();
        let now = self.clock.now();
        let ctl = self.controller;
        self.states.for_each_mut(|category, state| {
            let before = state.probability;
            state.roll_window(now, &ctl);
            if (state.probability - before).abs() > f64::EPSILON {
                debug!(
                    category = %category,
                    ewma_rate = state.ewma_rate,
                    from = before,
                    to = state.probability,
                    "sampling probability adjusted"
                );
            }
        });
        if let Some(seen) = &self.dedup {
            seen.purge_expired();
        }
        self.missing_key_logged.store(false, Ordering::Relaxed);
    }

    fn flush_telemetry(&self) {
        let c = &self.counters;
        crate::flush_counter!(c.sampled_in, "dbintel_sampler_records_total", "decision" => "sampled_in");
        crate::flush_counter!(c.sampled_out, "dbintel_sampler_records_total", "decision" => "sampled_out");
        crate::flush_counter!(c.always_sampled, "dbintel_sampler_records_total", "decision" => "always");
        crate::flush_counter!(c.duplicates, "dbintel_sampler_records_total", "decision" => "duplicate");
        crate::flush_counter!(c.missing_key, "dbintel_sampler_missing_key_total");
        crate::flush_counter!(c.categories_evicted, "dbintel_sampler_categories_evicted_total");
        self.rules.flush_telemetry();
        for (category, probability) in self.states.collect(|k, s| (k.clone(), s.probability)) {
            metrics::gauge!("dbintel_sampler_probability", "category" => category).set(probability);
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }
}

fn degrade(error: &crate::error::ConfigError) {
    log_event(&AdmissionEvent::StageDegraded {
        stage: STAGE_NAME.to_string(),
        reason: error.to_string(),
    });
}

impl std::fmt::Debug for AdaptiveSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSampler")
            .field("pass_through", &self.pass_through)
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}
