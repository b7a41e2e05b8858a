pub mod config;
pub mod events;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::AppConfig;
use routes::{health, notifications, session};
use services::inbox::SessionRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub sessions: SessionRegistry,
    pub metrics_handle: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/mark-all-read", post(notifications::mark_all_read))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/session/active-thread", put(session::set_active_thread))
        .route("/session", delete(session::close_session))
        .layer(axum::middleware::from_fn(fieldhub_shared::middleware::metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
