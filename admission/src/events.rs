use serde::Serialize;
use tracing::{info, info_span, warn};

/// Log target for admission events.
pub const EVENT_TARGET: &str = "admission";

/// Operator-facing admission event.
/// Serialized as JSON so alerting can key on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AdmissionEvent {
    /// The pipeline started with these stages.
    PipelineStarted {
        /// Enabled stage names in execution order.
        stages: Vec<String>,
    },
    /// The pipeline stopped.
    PipelineStopped {
        /// Why it stopped.
        reason: String,
    },
    /// A stage rejected its configuration and passes every record through.
    StageDegraded {
        /// Stage name.
        stage: String,
        /// Validation message.
        reason: String,
    },
    /// A circuit changed state.
    CircuitTransition {
        /// Entity the circuit protects.
        entity: String,
        /// Previous state.
        from: String,
        /// New state.
        to: String,
        /// Recovery timeout in effect after the transition.
        recovery_ms: u64,
    },
    /// A tenant exceeded its cardinality budget for the current window.
    CostBudgetExceeded {
        /// Tenant name.
        tenant: String,
        /// Configured distinct-signature ceiling.
        ceiling: i64,
    },
    /// A tenant's cost window closed.
    CostWindowReport {
        /// Tenant name.
        tenant: String,
        /// Estimated bytes observed in the window.
        window_bytes: u64,
        /// Records routed to overflow in the window.
        overflow: u64,
    },
    /// A tenant's ceiling is not positive, so its cost control is disabled.
    CostControlDisabled {
        /// Tenant name.
        tenant: String,
        /// Configured ceiling.
        ceiling: i64,
    },
}

impl AdmissionEvent {
    const fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::StageDegraded { .. } | Self::CostControlDisabled { .. } | Self::CostBudgetExceeded { .. }
        )
    }
}

/// Logs an event on the admission target as structured JSON.
pub fn log_event(event: &AdmissionEvent) {
    let span = info_span!(target: EVENT_TARGET, "admission_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    if event.is_warning() {
        warn!(target: EVENT_TARGET, event_json = %json, "admission event");
    } else {
        info!(target: EVENT_TARGET, event_json = %json, "admission event");
    }
}
