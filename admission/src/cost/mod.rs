//! Cost control stage.
//!
//! Bounds per-tenant cardinality. Each tenant tracks the signatures (values of
//! the configured high-cardinality attributes) seen within a rolling window.
//! Records whose signature fits the budget keep full detail. The rest have
//! those values replaced by [`OVERFLOW_PLACEHOLDER`] and are coalesced into
//! one record per remaining attribute set, carrying the number of records it
//! stands for. No record is dropped: retained plus coalesced counts always
//! equal the input count.
//!
//! Volume is accounted alongside cardinality. Every record's
//! [`estimated_size`](TelemetryRecord::estimated_size) is charged to its
//! tenant's window, and the stage counts the bytes it observes and emits, so
//! coalescing savings show up as the difference.

pub mod budget;
pub mod config;

pub use budget::{BudgetSnapshot, CostBudget, Verdict, WindowSummary};
pub use config::{CostControlConfig, DEFAULT_TENANT};

use crate::clock::SharedClock;
use crate::counters::PendingCounter;
use crate::events::{log_event, AdmissionEvent};
use crate::pipeline::{BatchOutcome, CancelCheck, Processor};
use crate::record::key::{digest_to_u64, write_field};
use crate::record::{keys, Attributes, EntityKey, Payload, TelemetryRecord};
use crate::store::{BoundedStore, EvictionReason, StoreConfig, StoreStats};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stage name used in logs and metrics.
pub const STAGE_NAME: &str = "cost_control";

/// Value that replaces high-cardinality attributes on overflow records.
pub const OVERFLOW_PLACEHOLDER: &str = "_other";

const TRUNCATION_SUFFIX: &str = "... [truncated]";

#[derive(Debug, Default)]
struct CostCounters {
    retained: PendingCounter,
    overflowed: PendingCounter,
    coalesced_emitted: PendingCounter,
    unbudgeted: PendingCounter,
    truncated: PendingCounter,
    tenants_evicted: PendingCounter,
    bytes_observed: PendingCounter,
    bytes_emitted: PendingCounter,
}

/// Counters and state sizes of the cost control stage.
#[derive(Debug, Clone, Serialize)]
pub struct CostStats {
    /// Records passed with full detail.
    pub retained: u64,
    /// Records routed to the overflow path.
    pub overflowed: u64,
    /// Coalesced records emitted for overflowed input.
    pub coalesced_emitted: u64,
    /// Records of tenants with cost control disabled.
    pub unbudgeted: u64,
    /// Log bodies truncated.
    pub truncated: u64,
    /// Estimated bytes of input records, after truncation.
    pub bytes_observed: u64,
    /// Estimated bytes of emitted records, including coalesced ones.
    pub bytes_emitted: u64,
    /// Tenant budget store.
    pub tenants: StoreStats,
    /// `true` when configuration was rejected.
    pub pass_through: bool,
}

#[derive(PartialEq, Eq, Hash)]
struct CoalesceKey {
    tenant: String,
    attributes: Attributes,
    kind: &'static str,
}

struct Aggregate {
    record: TelemetryRecord,
    count: u64,
}

impl Aggregate {
    fn merge(&mut self, other: TelemetryRecord) {
        self.count += 1;
        match (&mut self.record.payload, other.payload) {
            (Payload::Sum { value }, Payload::Sum { value: more }) => *value += more,
            (Payload::Gauge { value }, Payload::Gauge { value: latest }) => {
                if other.timestamp >= self.record.timestamp {
                    *value = latest;
                }
            }
            _ => {}
        }
        self.record.timestamp = self.record.timestamp.max(other.timestamp);
    }
}

/// The cost control stage.
pub struct CostControl {
    config: CostControlConfig,
    pass_through: bool,
    clock: SharedClock,
    tenants: BoundedStore<String, CostBudget>,
    counters: Arc<CostCounters>,
}

impl CostControl {
    /// Creates the stage. Invalid configuration puts it in pass-through mode;
    /// non-positive ceilings disable only the affected tenants. Both are
    /// logged once, here.
    #[must_use]
    pub fn new(config: CostControlConfig, clock: SharedClock) -> Self {
        let pass_through = match config.validate() {
            Ok(()) => false,
            Err(e) => {
                log_event(&AdmissionEvent::StageDegraded {
                    stage: STAGE_NAME.to_string(),
                    reason: e.to_string(),
                });
                true
            }
        };
        if !pass_through {
            if config.default_ceiling <= 0 {
                log_event(&AdmissionEvent::CostControlDisabled {
                    tenant: "*".to_string(),
                    ceiling: config.default_ceiling,
                });
            }
            let mut disabled: Vec<_> = config.tenant_ceilings.iter().filter(|(_, c)| **c <= 0).collect();
            disabled.sort();
            for (tenant, ceiling) in disabled {
                log_event(&AdmissionEvent::CostControlDisabled {
                    tenant: tenant.clone(),
                    ceiling: *ceiling,
                });
            }
        }

        let counters = Arc::new(CostCounters::default());
        let on_evict = Arc::clone(&counters);
        let tenants = BoundedStore::new(
            StoreConfig::new(config.max_tenants).with_ttl(config.tenant_ttl()),
            Arc::clone(&clock),
        )
        .with_eviction_callback(Arc::new(move |tenant: &String, _: &CostBudget, reason| {
            metrics::gauge!("dbintel_cost_signatures", "tenant" => tenant.clone()).set(0.0);
            if reason == EvictionReason::Capacity {
                on_evict.tenants_evicted.incr();
            }
            debug!(tenant = %tenant, ?reason, "cost budget released");
        }));

        Self {
            config,
            pass_through,
            clock,
            tenants,
            counters,
        }
    }

    /// Returns `true` if configuration was rejected.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        self.pass_through
    }

    /// Budget view of `tenant`, if it is tracked.
    #[must_use]
    pub fn budget_snapshot(&self, tenant: &str) -> Option<BudgetSnapshot> {
        self.tenants.read(&tenant.to_string(), CostBudget::snapshot)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CostStats {
        let c = &self.counters;
        CostStats {
            retained: c.retained.get(),
            overflowed: c.overflowed.get(),
            coalesced_emitted: c.coalesced_emitted.get(),
            unbudgeted: c.unbudgeted.get(),
            truncated: c.truncated.get(),
            bytes_observed: c.bytes_observed.get(),
            bytes_emitted: c.bytes_emitted.get(),
            tenants: self.tenants.stats(),
            pass_through: self.pass_through,
        }
    }

    fn tenant_of(&self, record: &TelemetryRecord) -> String {
        record
            .attributes
            .get_non_empty(&self.config.tenant_attribute)
            .unwrap_or(DEFAULT_TENANT)
            .to_string()
    }

    fn signature(&self, attributes: &Attributes) -> u64 {
        let mut hasher = Sha256::new();
        for name in &self.config.high_cardinality_attributes {
            if let Some(value) = attributes.get_str(name) {
                write_field(&mut hasher, name.as_bytes());
                write_field(&mut hasher, value.as_bytes());
            }
        }
        digest_to_u64(&hasher.finalize())
    }

    fn judge(&self, tenant: &str, signature: u64, bytes: u64, now: Instant) -> Option<Verdict> {
        let ceiling = usize::try_from(self.config.ceiling_for(tenant)).ok().filter(|c| *c > 0)?;
        let window = self.config.window();
        Some(self.tenants.upsert(
            tenant.to_string(),
            || CostBudget::new(ceiling, now),
            |budget| {
                budget.add_volume(bytes);
                budget.admit(signature, now, window)
            },
        ))
    }

    fn to_overflow(&self, record: &mut TelemetryRecord) {
        for name in &self.config.high_cardinality_attributes {
            if record.attributes.contains(name) {
                record.attributes.insert(name.as_str(), OVERFLOW_PLACEHOLDER);
            }
        }
        record.key = EntityKey::derive(&record.attributes);
        record.attributes.insert(keys::COST_OVERFLOW, "true");
    }

    fn truncate_log_body(&self, record: &mut TelemetryRecord) {
        let limit = self.config.max_log_body_bytes;
        if limit == 0 {
            return;
        }
        if let Payload::Log { body, .. } = &mut record.payload {
            if body.len() > limit {
                let mut cut = limit;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
                body.push_str(TRUNCATION_SUFFIX);
                self.counters.truncated.incr();
            }
        }
    }
}

impl Processor for CostControl {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn process_batch(&self, batch: Vec<TelemetryRecord>, cancel: &CancellationToken) -> BatchOutcome {
        if self.pass_through {
            return BatchOutcome::complete(batch);
        }
        let check = CancelCheck::new(cancel, self.config.cancel_check_interval);
        let now = self.clock.now();
        let total = batch.len();
        let mut kept = Vec::with_capacity(total);
        let mut slots: HashMap<CoalesceKey, usize> = HashMap::new();
        let mut aggregates: Vec<Aggregate> = Vec::new();
        let mut cancelled_at = None;

        for (index, mut record) in batch.into_iter().enumerate() {
            if check.should_stop(index) {
                cancelled_at = Some(index);
                break;
            }
            self.truncate_log_body(&mut record);
            let tenant = self.tenant_of(&record);
            let signature = self.signature(&record.attributes);
            let bytes = record.estimated_size();
            self.counters.bytes_observed.add(bytes);

            match self.judge(&tenant, signature, bytes, now) {
                None => {
                    self.counters.unbudgeted.incr();
                    self.counters.bytes_emitted.add(bytes);
                    kept.push(record);
                }
                Some(Verdict::Retained) => {
                    self.counters.retained.incr();
                    self.counters.bytes_emitted.add(bytes);
                    kept.push(record);
                }
                Some(Verdict::Overflow { onset }) => {
                    self.counters.overflowed.incr();
                    if onset {
                        metrics::counter!("dbintel_cost_overflow_events_total", "tenant" => tenant.clone())
                            .increment(1);
                        log_event(&AdmissionEvent::CostBudgetExceeded {
                            tenant: tenant.clone(),
                            ceiling: self.config.ceiling_for(&tenant),
                        });
                    }
                    self.to_overflow(&mut record);
                    let key = CoalesceKey {
                        tenant,
                        attributes: record.attributes.clone(),
                        kind: record.payload.kind(),
                    };
                    match slots.get(&key) {
                        Some(&slot) => aggregates[slot].merge(record),
                        None => {
                            slots.insert(key, aggregates.len());
                            aggregates.push(Aggregate { record, count: 1 });
                        }
                    }
                }
            }
        }

        self.counters.coalesced_emitted.add(aggregates.len() as u64);
        kept.extend(aggregates.into_iter().map(|mut agg| {
            agg.record
                .attributes
                .insert(keys::COST_OVERFLOW_COUNT, agg.count.to_string());
            self.counters.bytes_emitted.add(agg.record.estimated_size());
            agg.record
        }));
        match cancelled_at {
            Some(index) => BatchOutcome::partial(kept, total - index),
            None => BatchOutcome::complete(kept),
        }
    }

    fn housekeep(&self) {
        if self.pass_through {
            return;
        }
        self.tenants.purge_expired();
        let now = self.clock.now();
        let window = self.config.window();
        let mut reports = Vec::new();
        self.tenants.for_each_mut(|tenant, budget| {
            if let Some(summary) = budget.roll_window(now, window) {
                if summary.overflow > 0 {
                    debug!(tenant = %tenant, overflow = summary.overflow, "cost window closed with overflow");
                }
                if self.config.report_windows && summary.bytes > 0 {
                    reports.push(AdmissionEvent::CostWindowReport {
                        tenant: tenant.clone(),
                        window_bytes: summary.bytes,
                        overflow: summary.overflow,
                    });
                }
            }
        });
        for report in &reports {
            log_event(report);
        }
    }

    fn flush_telemetry(&self) {
        let c = &self.counters;
        crate::flush_counter!(c.retained, "dbintel_cost_records_total", "decision" => "retained");
        crate::flush_counter!(c.overflowed, "dbintel_cost_records_total", "decision" => "overflow");
        crate::flush_counter!(c.unbudgeted, "dbintel_cost_records_total", "decision" => "unbudgeted");
        crate::flush_counter!(c.coalesced_emitted, "dbintel_cost_coalesced_records_total");
        crate::flush_counter!(c.truncated, "dbintel_cost_truncated_logs_total");
        crate::flush_counter!(c.tenants_evicted, "dbintel_cost_tenants_evicted_total");
        crate::flush_counter!(c.bytes_observed, "dbintel_cost_bytes_total", "direction" => "observed");
        crate::flush_counter!(c.bytes_emitted, "dbintel_cost_bytes_total", "direction" => "emitted");

        let mut per_tenant = Vec::new();
        self.tenants.for_each_mut(|tenant, budget| {
            per_tenant.push((
                tenant.clone(),
                budget.take_pending_overflow(),
                budget.take_pending_bytes(),
                budget.snapshot().tracked_signatures,
            ));
        });
        for (tenant, overflow, bytes, tracked) in per_tenant {
            if overflow > 0 {
                metrics::counter!("dbintel_cost_overflow_records_total", "tenant" => tenant.clone())
                    .increment(overflow);
            }
            if bytes > 0 {
                metrics::counter!("dbintel_cost_tenant_bytes_total", "tenant" => tenant.clone()).increment(bytes);
            }
            metrics::gauge!("dbintel_cost_signatures", "tenant" => tenant).set(tracked as f64);
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }
}

impl std::fmt::Debug for CostControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostControl")
            .field("pass_through", &self.pass_through)
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::Severity;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn record(tenant: &str, session: &str, value: f64) -> TelemetryRecord {
        let attributes: Attributes = [
            (keys::DB_NAME, "orders"),
            (keys::TENANT, tenant),
            ("session.id", session),
            ("db.operation", "select"),
        ]
        .into_iter()
        .collect();
        TelemetryRecord::new(Utc::now(), Payload::Sum { value }, attributes)
    }

    fn stage(config: CostControlConfig) -> (Arc<ManualClock>, CostControl) {
        let clock = ManualClock::new();
        (clock.clone(), CostControl::new(config, clock))
    }

    fn run(cc: &CostControl, batch: Vec<TelemetryRecord>) -> Vec<TelemetryRecord> {
        cc.process_batch(batch, &CancellationToken::new()).records
    }

    fn overflow_count(records: &[TelemetryRecord]) -> u64 {
        records
            .iter()
            .filter_map(|r| r.attributes.get_u64(keys::COST_OVERFLOW_COUNT))
            .sum()
    }

    #[test]
    fn test_overflow_is_coalesced_with_placeholder() {
        let (_, cc) = stage(CostControlConfig::default().with_tenant_ceiling("acme", 2));
        let batch = (0..5).map(|i| record("acme", &format!("s{i}"), 1.0)).collect();
        let out = run(&cc, batch);

        assert_eq!(out.len(), 3);
        let agg = &out[2];
        assert_eq!(agg.attributes.get_str("session.id"), Some(OVERFLOW_PLACEHOLDER));
        assert_eq!(agg.attributes.get_bool(keys::COST_OVERFLOW), Some(true));
        assert_eq!(agg.attributes.get_u64(keys::COST_OVERFLOW_COUNT), Some(3));
        assert_eq!(agg.payload, Payload::Sum { value: 3.0 });
        assert_eq!(agg.attributes.get_str("db.operation"), Some("select"));
    }

    #[test]
    fn test_conservation_holds_per_batch() {
        let (_, cc) = stage(CostControlConfig::default().with_tenant_ceiling("acme", 7));
        let batch: Vec<_> = (0..40).map(|i| record("acme", &format!("s{i}"), 1.0)).collect();
        let out = run(&cc, batch);
        let retained = out.iter().filter(|r| !r.attributes.contains(keys::COST_OVERFLOW)).count() as u64;
        assert_eq!(retained + overflow_count(&out), 40);
    }

    #[test]
    fn test_tenants_have_independent_budgets() {
        let (_, cc) = stage(CostControlConfig::default().with_default_ceiling(1));
        let out = run(&cc, vec![record("a", "s1", 1.0), record("b", "s1", 1.0), record("a", "s2", 1.0)]);
        assert_eq!(out.len(), 3);
        assert_eq!(overflow_count(&out), 1);
        assert_eq!(cc.budget_snapshot("a").unwrap().total_overflow, 1);
        assert_eq!(cc.budget_snapshot("b").unwrap().total_overflow, 0);
    }

    #[test]
    fn test_missing_tenant_uses_default_tenant() {
        let (_, cc) = stage(CostControlConfig::default());
        let mut r = record("x", "s", 1.0);
        r.attributes.remove(keys::TENANT);
        run(&cc, vec![r]);
        assert!(cc.budget_snapshot(DEFAULT_TENANT).is_some());
    }

    #[test]
    fn test_non_positive_ceiling_disables_tenant() {
        let (_, cc) = stage(CostControlConfig::default().with_tenant_ceiling("free", 0));
        let out = run(&cc, (0..10).map(|i| record("free", &format!("s{i}"), 1.0)).collect());
        assert_eq!(out.len(), 10);
        assert_eq!(cc.stats().unbudgeted, 10);
        assert!(cc.budget_snapshot("free").is_none());
    }

    #[test]
    fn test_gauge_keeps_latest_and_log_keeps_first() {
        let (_, cc) = stage(CostControlConfig::default().with_default_ceiling(1));
        let t0 = Utc::now();
        let gauge = |session: &str, value: f64, at| {
            let mut r = record("acme", session, 0.0);
            r.payload = Payload::Gauge { value };
            r.timestamp = at;
            r
        };
        let log = |session: &str, body: &str| {
            let mut r = record("acme", session, 0.0);
            r.payload = Payload::Log {
                severity: Severity::Info,
                body: body.into(),
            };
            r
        };
        let out = run(
            &cc,
            vec![
                gauge("keep", 0.0, t0),
                gauge("s2", 5.0, t0 + ChronoDuration::seconds(2)),
                gauge("s3", 9.0, t0 + ChronoDuration::seconds(1)),
                log("s4", "first"),
                log("s5", "second"),
            ],
        );
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].payload, Payload::Gauge { value: 5.0 });
        assert_eq!(out[1].attributes.get_u64(keys::COST_OVERFLOW_COUNT), Some(2));
        assert!(matches!(&out[2].payload, Payload::Log { body, .. } if body == "first"));
    }

    #[test]
    fn test_window_rollover_resets_overflow_aggregate() {
        let (clock, cc) = stage(CostControlConfig::default().with_default_ceiling(1));
        run(&cc, vec![record("acme", "s1", 1.0), record("acme", "s2", 1.0)]);
        assert_eq!(cc.budget_snapshot("acme").unwrap().window_overflow, 1);

        clock.advance(Duration::from_secs(60));
        cc.housekeep();
        let snap = cc.budget_snapshot("acme").unwrap();
        assert_eq!(snap.window_overflow, 0);
        assert_eq!(snap.total_overflow, 1);
        assert_eq!(snap.total_retained + snap.total_overflow, snap.total_observed);
    }

    #[test]
    fn test_volume_is_charged_per_tenant() {
        let (clock, cc) = stage(CostControlConfig::default().with_tenant_ceiling("acme", 2));
        let batch: Vec<_> = (0..6).map(|i| record("acme", &format!("s{i}"), 1.0)).collect();
        let input_bytes: u64 = batch.iter().map(TelemetryRecord::estimated_size).sum();
        let out = run(&cc, vec![record("beta", "s0", 1.0)]);
        let beta_bytes = out[0].estimated_size();

        let out = run(&cc, batch);
        let acme = cc.budget_snapshot("acme").unwrap();
        assert_eq!(acme.window_bytes, input_bytes);
        assert_eq!(acme.total_bytes, input_bytes);
        assert_eq!(cc.budget_snapshot("beta").unwrap().total_bytes, beta_bytes);

        let stats = cc.stats();
        assert_eq!(stats.bytes_observed, input_bytes + beta_bytes);
        let emitted: u64 = out.iter().map(TelemetryRecord::estimated_size).sum();
        assert_eq!(stats.bytes_emitted, emitted + beta_bytes);
        assert!(stats.bytes_emitted < stats.bytes_observed);

        clock.advance(Duration::from_secs(60));
        cc.housekeep();
        let acme = cc.budget_snapshot("acme").unwrap();
        assert_eq!(acme.window_bytes, 0);
        assert_eq!(acme.total_bytes, input_bytes);
    }

    #[test]
    fn test_window_reports_do_not_disturb_accounting() {
        let mut config = CostControlConfig::default().with_default_ceiling(1);
        config.report_windows = true;
        let (clock, cc) = stage(config);
        run(&cc, vec![record("acme", "s1", 1.0), record("acme", "s2", 1.0)]);
        clock.advance(Duration::from_secs(60));
        cc.housekeep();
        let snap = cc.budget_snapshot("acme").unwrap();
        assert_eq!(snap.window_bytes, 0);
        assert_eq!(snap.total_retained + snap.total_overflow, snap.total_observed);
    }

    #[test]
    fn test_long_log_bodies_are_truncated() {
        let mut config = CostControlConfig::default();
        config.max_log_body_bytes = 8;
        let (_, cc) = stage(config);
        let mut r = record("acme", "s", 0.0);
        r.payload = Payload::Log {
            severity: Severity::Warn,
            body: "ééééééé".into(),
        };
        let out = run(&cc, vec![r]);
        assert!(matches!(&out[0].payload, Payload::Log { body, .. } if body == "éééé... [truncated]"));
        assert_eq!(cc.stats().truncated, 1);
    }
}
