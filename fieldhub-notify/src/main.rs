use std::sync::Arc;

use fieldhub_notify::config::AppConfig;
use fieldhub_notify::events::{Backoff, RabbitChangeFeed};
use fieldhub_notify::services::inbox::{InboxSettings, SessionRegistry};
use fieldhub_notify::services::store::PgNotificationStore;
use fieldhub_notify::AppState;
use fieldhub_shared::clients::db::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    fieldhub_shared::middleware::init_tracing("fieldhub-notify", config.log_format());
    let port = config.port;

    // Set JWT_SECRET env var for the auth extractor middleware
    std::env::set_var("JWT_SECRET", &config.jwt_secret);

    let pool = create_pool(&config.database_url, config.db_pool_size)?;
    let store = Arc::new(PgNotificationStore::new(pool));

    // Connects lazily; a broker outage only means no live notifications.
    let feed = Arc::new(RabbitChangeFeed::new(
        config.rabbitmq_url.clone(),
        Backoff::new(config.reconnect_initial(), config.reconnect_max()),
    ));

    let metrics_handle = if config.metrics_enabled {
        Some(fieldhub_shared::middleware::init_metrics()?)
    } else {
        None
    };

    let sessions = SessionRegistry::new(
        feed,
        store,
        InboxSettings {
            debounce_window: config.debounce_window(),
            recent_limit: config.recent_limit,
            badge_mode: config.badge_mode,
            idle_ttl: config.session_idle(),
        },
    );
    let sweeper = sessions.spawn_idle_sweeper(config.session_sweep());

    let state = Arc::new(AppState {
        config,
        sessions: sessions.clone(),
        metrics_handle,
    });
    let app = fieldhub_notify::router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "fieldhub-notify starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    sessions.shutdown_all().await;
    tracing::info!("fieldhub-notify stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
