//! Prometheus metrics endpoint.
//!
//! Exposes the counters and histograms recorded by the coordinator, e.g.
//! `saga_transactions_started_total`, `saga_transactions_compensated_total` and
//! `saga_step_duration_seconds`.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

const PROMETHEUS_TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics: renders the saga metrics in the Prometheus text format.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    let body = handle.render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_TEXT_FORMAT)],
        body,
    )
}
