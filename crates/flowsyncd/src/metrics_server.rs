//! HTTP metrics server for Prometheus scraping
//!
//! Binds to localhost only.

use crate::metrics::MetricsCollector;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use std::net::{Ipv6Addr, SocketAddr};
use tracing::{error, info};

/// Default metrics server port
pub const DEFAULT_METRICS_PORT: u16 = 9092;

#[derive(Clone)]
struct MetricsServerState {
    collector: MetricsCollector,
}

fn router(collector: MetricsCollector) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsServerState { collector })
}

/// Serve `/metrics` and `/health` on `[::1]:port` until the task is dropped
pub async fn start_metrics_server(
    collector: MetricsCollector,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Starting metrics server on http://[::1]:{}/metrics", port);

    axum::serve(listener, router(collector))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
}

/// Handle /metrics endpoint - Prometheus text format
async fn metrics_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.collector.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// Handle /health endpoint
///
/// Reports degraded once any transport error or resolution failure has been
/// seen, since the datapath may then be missing flows.
async fn health_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let c = &state.collector;
    let degraded =
        c.transport_errors_total.get() > 0.0 || c.resolution_failures_total.get() > 0.0;
    let status = if degraded { "degraded" } else { "healthy" };

    let body = format!(
        r#"{{"status": "{}", "hosts": {}, "routes": {}}}"#,
        status,
        c.host_table_size.get(),
        c.route_table_size.get()
    );

    (StatusCode::OK, [("content-type", "application/json")], body)
}
