// src/core/metrics.rs

//! Defines and registers Prometheus metrics for daemon monitoring, plus the
//! optional HTTP server that exposes them.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram,
};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{error, info};

lazy_static! {
    /// Total number of discovery cycles started.
    pub static ref CYCLES_TOTAL: Counter =
        register_counter!("haproxy_discovery_cycles_total", "Total number of discovery cycles started.").unwrap();
    /// Total number of cycles that ended in an error.
    pub static ref CYCLE_FAILURES_TOTAL: Counter =
        register_counter!("haproxy_discovery_cycle_failures_total", "Total number of failed discovery cycles.").unwrap();
    /// Instances returned by the most recent discovery snapshot, before tag filtering.
    pub static ref INSTANCES_DISCOVERED: Gauge =
        register_gauge!("haproxy_discovery_instances_discovered", "Instances in the most recent discovery snapshot.").unwrap();
    /// Total number of services flagged as changed across all cycles.
    pub static ref SERVICES_CHANGED_TOTAL: Counter =
        register_counter!("haproxy_discovery_services_changed_total", "Total number of services reconciled due to changes.").unwrap();
    /// Total number of service removals processed.
    pub static ref SERVICES_REMOVED_TOTAL: Counter =
        register_counter!("haproxy_discovery_services_removed_total", "Total number of removed services processed.").unwrap();
    /// Total number of reconciliation retries caused by Dataplane version conflicts.
    pub static ref VERSION_CONFLICT_RETRIES_TOTAL: Counter =
        register_counter!("haproxy_discovery_version_conflict_retries_total", "Total number of reconciliation retries after version conflicts.").unwrap();
    /// A histogram of full cycle durations.
    pub static ref CYCLE_DURATION_SECONDS: Histogram =
        register_histogram!("haproxy_discovery_cycle_duration_seconds", "Duration of full discovery cycles in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
    {
        error!("Metrics server error: {}", e);
    }
}
