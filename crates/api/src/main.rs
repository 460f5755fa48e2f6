//! Cadence API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cadence_common::config::AppConfig;
use cadence_common::db;
use cadence_common::redis_pool::create_redis_pool;
use cadence_worker::driver::QueueDriver;

use cadence_api::routes::create_router;
use cadence_api::state::AppState;

/// None of the routes take a meaningful body.
const MAX_BODY_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("cadence_api=debug,cadence_worker=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Cadence API server...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    // Invocations run inline; continuations go to the worker through Redis.
    let driver = Arc::new(QueueDriver::from_config(pool, redis, &config)?);

    let port = config.api_port;
    let state = AppState::new(driver, config);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
