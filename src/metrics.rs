//! Prometheus metrics exporter.
//!
//! Grounded on the teacher's `metrics.rs`: same `PrometheusBuilder` setup
//! and `/metrics` route over a standalone axum router. The CPU/heap
//! profiling endpoints are dropped with it (see DESIGN.md) since this
//! binary has no request-latency surface worth flame-graphing.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn initialize_bridge_metrics() {
    metrics::gauge!("line_source.connected").set(0.0);
    metrics::gauge!("datagram_source.connected").set(0.0);
    metrics::gauge!("broadcast_hub.connections").set(0.0);
    metrics::counter!("line_source.lines_total").absolute(0);
    metrics::counter!("datagram_source.datagrams_total").absolute(0);
}

pub async fn start_metrics_server(port: u16) {
    let handle = METRICS_HANDLE.get_or_init(init_metrics).clone();

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("metrics server listening on http://{addr}/metrics");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("failed to bind metrics server: {e}");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::warn!("metrics server exited: {e}");
    }
}
