//! Circuit breaker stage.
//!
//! Sheds records about a failing entity (the database named by the record's
//! key) once failure signals exceed a threshold within a window, and restores
//! traffic after a recovery timeout that doubles on every failed probe.
//!
//! ```text
//! Closed --N failures in W--> Open --timer--> HalfOpen --probe ok--> Closed
//!                               ^                |
//!                               +--probe failed--+
//! ```

pub mod config;
pub mod signal;
pub mod state;

pub use config::CircuitBreakerConfig;
pub use signal::{FailureKind, Signal, SignalClassifier};
pub use state::{Admission, CircuitState, CircuitStats, EntityCircuit, Transition};

use crate::clock::SharedClock;
use crate::counters::PendingCounter;
use crate::events::{log_event, AdmissionEvent};
use crate::pipeline::{BatchOutcome, CancelCheck, Processor};
use crate::record::{keys, TelemetryRecord};
use crate::store::{BoundedStore, EvictionReason, StoreConfig, StoreStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stage name used in logs and metrics.
pub const STAGE_NAME: &str = "circuit_breaker";

#[derive(Debug, Default)]
struct BreakerCounters {
    admitted: PendingCounter,
    probes: PendingCounter,
    dropped: PendingCounter,
    failures: PendingCounter,
    keyless: PendingCounter,
    opened: PendingCounter,
    half_opened: PendingCounter,
    closed: PendingCounter,
    open_evicted: PendingCounter,
}

/// Counters and state sizes of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Records admitted through closed circuits.
    pub admitted: u64,
    /// Records admitted as half-open probes.
    pub probes: u64,
    /// Records dropped by open circuits.
    pub dropped: u64,
    /// Failure signals observed on admitted records.
    pub failures: u64,
    /// Records without an entity key, passed through.
    pub keyless: u64,
    /// Closed -> Open and HalfOpen -> Open transitions.
    pub opened: u64,
    /// Open -> HalfOpen transitions.
    pub half_opened: u64,
    /// HalfOpen -> Closed transitions.
    pub closed: u64,
    /// Circuits currently not closed, by entity.
    pub tripped: Vec<(String, CircuitState)>,
    /// Entity state store.
    pub entities: StoreStats,
    /// `true` when configuration was rejected.
    pub pass_through: bool,
}

/// The circuit breaker stage.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    classifier: Option<SignalClassifier>,
    clock: SharedClock,
    entities: BoundedStore<String, EntityCircuit>,
    counters: Arc<BreakerCounters>,
}

impl CircuitBreaker {
    /// Creates a breaker. Invalid configuration puts it in pass-through mode.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        let classifier = config
            .validate()
            .and_then(|()| SignalClassifier::new(&config))
            .map_err(|e| {
                log_event(&AdmissionEvent::StageDegraded {
                    stage: STAGE_NAME.to_string(),
                    reason: e.to_string(),
                });
            })
            .ok();

        let counters = Arc::new(BreakerCounters::default());
        let on_evict = Arc::clone(&counters);
        let entities = BoundedStore::new(
            StoreConfig::new(config.max_entities).with_ttl(config.entity_ttl()),
            Arc::clone(&clock),
        )
        .with_eviction_callback(Arc::new(move |entity: &String, circuit: &EntityCircuit, reason| {
            metrics::gauge!("dbintel_circuit_open_seconds", "entity" => entity.clone()).set(0.0);
            if circuit.state() == CircuitState::Closed {
                debug!(entity = %entity, ?reason, "circuit released");
            } else {
                on_evict.open_evicted.incr();
                warn!(entity = %entity, state = %circuit.state(), ?reason, "tripped circuit released");
            }
        }));

        Self {
            config,
            classifier,
            clock,
            entities,
            counters,
        }
    }

    /// Returns `true` if configuration was rejected.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        self.classifier.is_none()
    }

    /// Last recorded state of `entity`. Timers are applied on the next
    /// record or housekeeping tick.
    #[must_use]
    pub fn state_of(&self, entity: &str) -> Option<CircuitState> {
        self.entities.peek(&entity.to_string()).map(|c| c.state())
    }

    /// Detailed statistics of `entity`.
    #[must_use]
    pub fn circuit_stats(&self, entity: &str) -> Option<CircuitStats> {
        let now = self.clock.now();
        self.entities.peek(&entity.to_string()).map(|c| c.stats(now))
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let c = &self.counters;
        let mut tripped: Vec<_> = self
            .entities
            .collect(|entity, circuit| (entity.clone(), circuit.state()))
            .into_iter()
            .filter(|(_, state)| *state != CircuitState::Closed)
            .collect();
        tripped.sort();
        BreakerStats {
            admitted: c.admitted.get(),
            probes: c.probes.get(),
            dropped: c.dropped.get(),
            failures: c.failures.get(),
            keyless: c.keyless.get(),
            opened: c.opened.get(),
            half_opened: c.half_opened.get(),
            closed: c.closed.get(),
            tripped,
            entities: self.entities.stats(),
            pass_through: self.is_pass_through(),
        }
    }

    fn report(&self, entity: &str, transition: Transition) {
        let counter = match transition.to {
            CircuitState::Open => &self.counters.opened,
            CircuitState::HalfOpen => &self.counters.half_opened,
            CircuitState::Closed => &self.counters.closed,
        };
        counter.incr();
        metrics::counter!(
            "dbintel_circuit_transitions_total",
            "entity" => entity.to_string(),
            "to" => transition.to.as_str()
        )
        .increment(1);
        log_event(&AdmissionEvent::CircuitTransition {
            entity: entity.to_string(),
            from: transition.from.as_str().to_string(),
            to: transition.to.as_str().to_string(),
            recovery_ms: u64::try_from(transition.recovery.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn admit(&self, classifier: &SignalClassifier, record: &TelemetryRecord, now: Instant) -> Option<CircuitState> {
        let entity = record.key.as_ref()?.database.clone();
        let signal = classifier.classify(record);
        let config = &self.config;

        let (admission, transitions) = self.entities.upsert(
            entity.clone(),
            || EntityCircuit::new(now, config),
            |circuit| {
                let (admission, timer) = circuit.try_acquire(now, config);
                let outcome = match (admission.is_admitted(), signal) {
                    (false, _) => None,
                    (true, Signal::Success) => circuit.record_success(now, config),
                    (true, Signal::Failure(_)) => circuit.record_failure(now, config),
                };
                (admission, [timer, outcome])
            },
        );

        for transition in transitions.into_iter().flatten() {
            self.report(&entity, transition);
        }
        if admission.is_admitted() && signal.is_failure() {
            self.counters.failures.incr();
        }
        match admission {
            Admission::Admit => {
                self.counters.admitted.incr();
                Some(CircuitState::Closed)
            }
            Admission::Probe => {
                self.counters.probes.incr();
                Some(CircuitState::HalfOpen)
            }
            Admission::Reject => {
                self.counters.dropped.incr();
                None
            }
        }
    }
}

impl Processor for CircuitBreaker {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn process_batch(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome {
        let Some(classifier) = &self.classifier else {
            return BatchOutcome::complete(batch);
        };
        let check = CancelCheck::new(cancel, self.config.cancel_check_interval);
        let now = self.clock.now();
        let total = batch.len();
        let mut kept = Vec::with_capacity(total);

        for (index, mut record) in batch.into_iter().enumerate() {
            if check.should_stop(index) {
                return BatchOutcome::partial(kept, total - index);
            }
            record.ensure_key();
            if record.key.is_none() {
                self.counters.keyless.incr();
                kept.push(record);
                continue;
            }
            if let Some(state) = self.admit(classifier, &record, now) {
                record.attributes.insert(keys::CIRCUIT_STATE, state.as_str());
                kept.push(record);
            }
        }
        BatchOutcome::complete(kept)
    }

    fn housekeep(&self) {
        if self.is_pass_through() {
            return;
        }
        let now = self.clock.now();
        let mut fired = Vec::new();
        self.entities.for_each_mut(|entity, circuit| {
            if let Some(transition) = circuit.poll_timer(now) {
                fired.push((entity.clone(), transition));
            }
        });
        for (entity, transition) in fired {
            self.report(&entity, transition);
        }
        self.entities.purge_expired();
    }

    fn flush_telemetry(&self) {
        let c = &self.counters;
        crate::flush_counter!(c.admitted, "dbintel_circuit_records_total", "decision" => "admitted");
        crate::flush_counter!(c.probes, "dbintel_circuit_records_total", "decision" => "probe");
        crate::flush_counter!(c.dropped, "dbintel_circuit_dropped_total");
        crate::flush_counter!(c.failures, "dbintel_circuit_failures_total");
        crate::flush_counter!(c.keyless, "dbintel_circuit_records_total", "decision" => "keyless");
        crate::flush_counter!(c.open_evicted, "dbintel_circuit_tripped_evicted_total");

        let now = self.clock.now();
        let open_for = self.entities.collect(|entity, circuit| {
            let seconds = circuit
                .opened_at()
                .map_or(0.0, |at| now.saturating_duration_since(at).as_secs_f64());
            (entity.clone(), seconds)
        });
        for (entity, seconds) in open_for {
            metrics::gauge!("dbintel_circuit_open_seconds", "entity" => entity).set(seconds);
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("pass_through", &self.is_pass_through())
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}
