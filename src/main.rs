/// Kairo: workflow execution engine
///
/// Main entry point for the Kairo server. Initializes configuration and starts
/// the HTTP server with workflow management and execution capabilities.

use kairo::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Runs, run history and credentials at /api/runs/*, /api/credentials/*
/// - Dynamic webhook execution at /webhook/{workflow_id}/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/kairo.db)
    let config = Config::default();
    start_server(config).await
}
