//! Control-plane endpoints served over a real socket.

use dbintel_admission::infrastructure::server::{self, ControlPlaneState};
use dbintel_admission::pipeline::Processor;
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod common;

use common::{metric, PipelineHarness};

struct RunningServer {
    base: String,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn start(state: ControlPlaneState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server::serve(listener, state, shutdown.clone()));
        Self { base, shutdown, task }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_health_and_readiness() {
    let h = PipelineHarness::with_defaults();
    let state = ControlPlaneState::new(Arc::new(h.pipeline), None);
    let server = RunningServer::start(state.clone()).await;
    let client = reqwest::Client::new();

    let live = client.get(format!("{}/health/live", server.base)).send().await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = client.get(format!("{}/health/ready", server.base)).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.set_ready(true);
    let ready = client.get(format!("{}/health/ready", server.base)).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = client.get(format!("{}/metrics", server.base)).send().await.unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_stats_reflect_processed_batches() {
    let h = PipelineHarness::with_defaults();
    h.run((0..5).map(|i| metric("orders", "query_metrics", &format!("q{i}"))).collect());
    let stage_names: Vec<_> = h.pipeline.stages().iter().map(|s| s.name()).collect();

    let server = RunningServer::start(ControlPlaneState::new(Arc::new(h.pipeline), None)).await;
    let body: serde_json::Value = reqwest::get(format!("{}/admission/stats", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    for name in stage_names {
        assert!(body.get(name).is_some(), "missing stage {name}");
    }
    server.stop().await;
}
