//! `GET /metrics` - Prometheus text exposition.
//!
//! Unauthenticated; expected to be scraped from inside the cluster.

use axum::{extract::State, response::IntoResponse};
use metrics_exporter_prometheus::PrometheusHandle;

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
