use crate::infrastructure::config::{BindAddress, ServerSettings};
use crate::pipeline::AdmissionPipeline;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use metrics_util::MetricKindMask;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state of the control-plane endpoints.
#[derive(Clone)]
pub struct ControlPlaneState {
    pipeline: Arc<AdmissionPipeline>,
    ready: Arc<AtomicBool>,
    metrics: Option<PrometheusHandle>,
}

impl ControlPlaneState {
    /// Creates state serving `pipeline`. Not ready until [`Self::set_ready`].
    #[must_use]
    pub fn new(pipeline: Arc<AdmissionPipeline>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            pipeline,
            ready: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    /// Flips the readiness probe.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

impl std::fmt::Debug for ControlPlaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneState")
            .field("pipeline", &self.pipeline)
            .field("ready", &self.ready.load(Ordering::Acquire))
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// Prometheus builder whose counter and gauge series are dropped after
/// `idle_timeout` without an update. Entity, tenant and category labels
/// come and go with the bounded stores, so their series must too.
#[must_use]
pub fn metrics_builder(idle_timeout: Option<Duration>) -> PrometheusBuilder {
    PrometheusBuilder::new().idle_timeout(MetricKindMask::COUNTER | MetricKindMask::GAUGE, idle_timeout)
}

/// Value of one rendered series, e.g. `name{label="x"}`.
#[cfg(test)]
pub(crate) fn rendered_value(rendered: &str, series: &str) -> Option<f64> {
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
        .and_then(|value| value.trim().parse().ok())
}

/// Installs the global Prometheus recorder that `/metrics` renders.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn install_metrics_recorder(idle_timeout: Option<Duration>) -> anyhow::Result<PrometheusHandle> {
    metrics_builder(idle_timeout)
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn render_metrics(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

async fn admission_stats(State(state): State<ControlPlaneState>) -> Json<serde_json::Value> {
    Json(state.pipeline.snapshot())
}

/// Control-plane routes.
pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/health/live", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(render_metrics))
        .route("/admission/stats", get(admission_stats))
        .with_state(state)
}

/// Serves the control plane on an already bound listener until `shutdown`
/// is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    state: ControlPlaneState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Control Plane listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Binds the configured address and runs the control plane.
///
/// # Errors
///
/// Returns an error if the address is invalid, cannot be bound, or the
/// server fails while running.
pub async fn run_server(
    settings: &ServerSettings,
    state: ControlPlaneState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = BindAddress::from(settings).to_socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}
