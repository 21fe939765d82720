//! VeriFactu dispatch service.
//!
//! Externally triggered (scheduled or manual) batch dispatcher: polls the
//! event queue, pushes due events through the reporting pipeline and exposes
//! the management actions. Stateless between invocations; all durable state
//! lives in Postgres.
mod config;
mod dispatcher;
mod error;
mod routes;
mod secrets;
mod store;

use axum::routing::{get, post};
use axum::Router;
use routes::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = config::DispatcherConfig::from_env()?;
    info!(
        mode = config.mode.as_str(),
        max_attempts = config.max_attempts,
        "starting VeriFactu dispatcher"
    );

    let store = store::Store::connect(&config.database_url).await.map_err(|e| {
        anyhow::anyhow!("failed to connect to database: {e}")
    })?;

    let port = config.port;
    let state = AppState {
        store,
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/", post(routes::invoke))
        .route("/health", get(routes::liveness))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("dispatcher listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("shutdown signal received");
}
