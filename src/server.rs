/// Server setup and initialization
///
/// Wires together all components: storage, registry, execution engine, and HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_run_routes, create_webhook_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::engine::ExecutionEngine,
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the router around an existing application state
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_run_routes())
        .merge(create_webhook_routes())
        .with_state(state)
}

/// Create the main Axum application with all routes
///
/// Opens the SQLite database in the data directory, loads the registry and
/// builds the execution engine with every built-in capability.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    tracing::info!("📋 Opening database");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database.sqlite_url())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = ExecutionEngine::with_builtins(config.engine.clone());
    tracing::debug!("Registered capabilities: {:?}", engine.invokers());

    tracing::info!("📥 Loading workflows");
    let state = AppState::connect(pool, engine)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize storage: {}", e))?;

    tracing::info!("✅ Application initialized successfully");
    Ok(router(state))
}

/// Start the HTTP server with the given configuration
///
/// Log verbosity follows `RUST_LOG` (default `info`).
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Kairo server...");
    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
