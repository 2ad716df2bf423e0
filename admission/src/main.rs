//! Admission pipeline host: JSON lines in on stdin, admitted records out on stdout.

use anyhow::Context;
use dbintel_admission::clock::MonotonicClock;
use dbintel_admission::events::{log_event, AdmissionEvent};
use dbintel_admission::housekeeping::Housekeeper;
use dbintel_admission::infrastructure::config::Settings;
use dbintel_admission::infrastructure::ingest::{run_ingest, IngestOptions};
use dbintel_admission::infrastructure::server::{self, ControlPlaneState};
use dbintel_admission::infrastructure::telemetry::TelemetryBuilder;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Settings::new().context("Failed to load configuration")?;

    let mut telemetry_builder =
        TelemetryBuilder::new(&config.telemetry.service_name, env!("CARGO_PKG_VERSION"))
            .with_log_level(&config.telemetry.log_level)
            .with_sampling_ratio(config.telemetry.sampling_ratio);

    telemetry_builder = if let Some(ref endpoint) = config.telemetry.otlp_endpoint {
        telemetry_builder.with_tracing(endpoint)
    } else {
        telemetry_builder
    };

    let telemetry = telemetry_builder
        .init()
        .context("Failed to initialize telemetry")?;

    info!("Admission pipeline starting...");

    let metrics = if config.server.enabled {
        Some(server::install_metrics_recorder(config.telemetry.metrics_idle_timeout())?)
    } else {
        None
    };

    let clock = MonotonicClock::shared();
    let pipeline = Arc::new(config.build_pipeline(&clock));
    log_event(&AdmissionEvent::PipelineStarted {
        stages: pipeline.stages().iter().map(|s| s.name().to_string()).collect(),
    });

    let housekeeper = Housekeeper::spawn(pipeline.stages(), config.pipeline.housekeeping_interval());
    let shutdown = CancellationToken::new();

    let server_task = if config.server.enabled {
        let state = ControlPlaneState::new(Arc::clone(&pipeline), metrics);
        state.set_ready(true);
        let server_config = config.server.clone();
        let server_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::run_server(&server_config, state, server_shutdown).await {
                error!("Control Plane failed: {:?}", e);
            }
        }))
    } else {
        None
    };

    let signal_shutdown = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    let options = IngestOptions::from(&config.pipeline);
    let reason = match run_ingest(
        &pipeline,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        options,
        &shutdown,
    )
    .await
    {
        Ok(stats) if shutdown.is_cancelled() => {
            info!(?stats, "ingest stopped");
            "signal received"
        }
        Ok(stats) => {
            info!(?stats, "ingest finished");
            "input closed"
        }
        Err(e) => {
            error!("Ingest failed: {:?}", e);
            "input error"
        }
    };

    shutdown.cancel();
    signal_task.abort();
    if let Some(task) = server_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Control Plane task ended abnormally");
        }
    }
    housekeeper.shutdown().await;
    pipeline.flush_telemetry();

    log_event(&AdmissionEvent::PipelineStopped {
        reason: reason.into(),
    });
    info!("Admission pipeline shutdown complete.");
    telemetry.shutdown();

    // A pending stdin read would otherwise hold the runtime open.
    match reason {
        "input closed" => Ok(()),
        "input error" => std::process::exit(1),
        _ => std::process::exit(0),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
