//! Admission control for database telemetry.
//!
//! Batches of metric points and log records pass through three stateful
//! stages before export: the adaptive sampler keeps per-category volume near
//! a target rate, the circuit breaker stops telemetry for databases that keep
//! failing, and cost control caps per-tenant cardinality. All keyed state
//! lives in capacity-bounded stores, so memory stays flat no matter how many
//! databases, queries or tenants show up.

#![warn(clippy::pedantic)]

/// Per-entity circuit breaker stage.
pub mod breaker;
/// Time sources.
pub mod clock;
/// Per-tenant cardinality control stage.
pub mod cost;
/// Decision counters exported to the metrics recorder.
pub mod counters;
/// Configuration errors.
pub mod error;
/// Structured admission events.
pub mod events;
/// Periodic stage maintenance.
pub mod housekeeping;
/// Infrastructure components (config, server, telemetry).
pub mod infrastructure;
/// Stage contract and the ordered pipeline.
pub mod pipeline;
/// Telemetry data model.
pub mod record;
/// Adaptive sampling stage.
pub mod sampler;
/// Bounded keyed state shared by every stage.
pub mod store;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use error::ConfigError;
pub use pipeline::{AdmissionPipeline, BatchOutcome, Processor};
pub use record::{Attributes, EntityKey, Payload, Severity, TelemetryRecord};
