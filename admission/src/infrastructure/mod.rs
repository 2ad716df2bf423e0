/// Configuration management for the admission host.
pub mod config;
/// Line-delimited JSON ingest loop.
pub mod ingest;
/// HTTP server and control plane.
pub mod server;
/// Telemetry setup for logging and tracing.
pub mod telemetry;
