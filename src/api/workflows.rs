/// Workflow management REST API endpoints
///
/// Provides CRUD operations for workflow definitions with hot-reload support.
/// Definitions are validated before they are stored; every change is swapped
/// into the registry immediately.

use crate::{
    runtime::engine::ExecutionEngine,
    workflow::{
        history::RunHistoryStore,
        registry::{CompiledWorkflow, WorkflowRegistry},
        storage::WorkflowStorage,
        types::WorkflowDefinition,
    },
};
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow and credential persistence
    pub storage: WorkflowStorage,
    /// Stored run records
    pub history: RunHistoryStore,
    /// Hot-reload registry of validated workflows
    pub registry: Arc<WorkflowRegistry>,
    pub engine: Arc<ExecutionEngine>,
}

impl AppState {
    /// Prepare the schemas and load the registry from `pool`
    pub async fn connect(pool: SqlitePool, engine: ExecutionEngine) -> Result<Self> {
        let storage = WorkflowStorage::new(pool.clone());
        storage.init_schema().await?;
        let history = RunHistoryStore::new(pool);
        history.init_schema().await?;

        let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
        registry.init_from_storage().await?;

        Ok(Self {
            storage,
            history,
            registry,
            engine: Arc::new(engine),
        })
    }
}

/// Error response: status plus `{ "error": message }`
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub(crate) fn internal(context: &str, e: impl std::fmt::Display) -> ApiError {
    tracing::error!("{}: {}", context, e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for workflow creation and update
#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    pub workflow: WorkflowDefinition,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
}

fn compile(workflow: WorkflowDefinition) -> Result<CompiledWorkflow, ApiError> {
    CompiledWorkflow::compile(workflow).map_err(|e| {
        tracing::warn!("❌ Rejected workflow: {}", e);
        api_error(StatusCode::BAD_REQUEST, e.to_string())
    })
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "nodes": [...], "connections": [...] } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<WorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowResponse>), ApiError> {
    let workflow = payload.workflow;
    if workflow.id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "workflow id is required"));
    }

    match state.storage.get_workflow(&workflow.id).await {
        Ok(Some(_)) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("workflow '{}' already exists", workflow.id),
            ))
        }
        Ok(None) => {}
        Err(e) => return Err(internal("Failed to look up workflow", e)),
    }

    let compiled = compile(workflow)?;
    state
        .storage
        .save_workflow(&compiled.workflow)
        .await
        .map_err(|e| internal("Failed to save workflow", e))?;
    let id = compiled.workflow.id.clone();
    let name = compiled.workflow.name.clone();
    state.registry.install(compiled);

    tracing::info!("🔥 Created workflow: {} ({})", id, name);
    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            message: format!("Workflow '{}' created successfully", name),
            id,
        }),
    ))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let workflows = state
        .storage
        .list_workflows()
        .await
        .map_err(|e| internal("Failed to list workflows", e))?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => Err(internal("Failed to get workflow", e)),
    }
}

/// Update an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<WorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => return Err(internal("Failed to look up workflow", e)),
    }

    let compiled = compile(workflow)?;
    state
        .storage
        .save_workflow(&compiled.workflow)
        .await
        .map_err(|e| internal("Failed to update workflow", e))?;
    let name = compiled.workflow.name.clone();
    state.registry.install(compiled);

    tracing::info!("🔥 Hot-reloaded workflow: {} ({})", id, name);
    Ok(Json(WorkflowResponse {
        id,
        message: format!("Workflow '{}' updated successfully", name),
    }))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.registry.remove_workflow(&id);
    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id))),
        Err(e) => Err(internal("Failed to delete workflow", e)),
    }
}
