use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldhub_shared::{HealthCheck, HealthResponse, HealthStatus};
use std::sync::Arc;

use crate::AppState;

/// Store pool and change-feed connectivity.
///
/// A disconnected feed only degrades the service: notifications stop, the
/// HTTP surface keeps answering from the caches.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let database = if state.sessions.store_ready() {
        HealthCheck::new("database", HealthStatus::Healthy)
    } else {
        HealthCheck::new("database", HealthStatus::Unhealthy).with_message("connection pool exhausted")
    };

    let change_feed = if state.sessions.feed_connected() {
        HealthCheck::new("change_feed", HealthStatus::Healthy)
    } else {
        HealthCheck::new("change_feed", HealthStatus::Degraded).with_message("not connected")
    };

    let response = HealthResponse::healthy("fieldhub-notify", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![database, change_feed]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Prometheus text exposition; 404 when metrics are disabled.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
