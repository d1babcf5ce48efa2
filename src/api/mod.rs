/// HTTP API Layer
///
/// This module provides the REST API endpoints. It handles:
/// - Workflow CRUD operations with validation
/// - Run execution, run history and credentials
/// - Dynamic webhook execution

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Run, history and credential endpoints
pub mod runs;

// Dynamic webhook execution endpoints
pub mod webhooks;

// Re-export router builders
pub use runs::create_run_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::{create_workflow_routes, AppState};
