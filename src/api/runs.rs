/// Run endpoints
///
/// Starts runs of stored or ad-hoc workflows, serves the persisted run history
/// and manages the named credentials handed to service-triggered runs.

use crate::{
    api::workflows::{api_error, internal, ApiError, AppState},
    runtime::{
        engine::RunOptions,
        trace::{RunRecord, RunSummary},
    },
    workflow::{
        registry::CompiledWorkflow,
        types::{RunMode, WorkflowDefinition},
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Body of `POST /api/workflows/{id}/runs`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub input: Value,
    pub mode: RunMode,
}

/// Body of `POST /api/runs`
#[derive(Debug, Deserialize)]
pub struct AdHocRunRequest {
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub mode: RunMode,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub value: String,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/workflows/{id}/runs",
            post(run_stored_workflow).get(list_runs),
        )
        .route("/api/runs", post(run_ad_hoc))
        .route("/api/runs/{run_id}", get(get_run))
        .route(
            "/api/credentials/{name}",
            put(put_credential).delete(delete_credential),
        )
}

/// Run a compiled workflow with the stored credentials and persist the record
pub async fn execute_and_record(
    state: &AppState,
    compiled: &CompiledWorkflow,
    input: Value,
    mode: RunMode,
) -> Result<RunRecord, ApiError> {
    let credentials = state
        .storage
        .load_credentials()
        .await
        .map_err(|e| internal("Failed to load credentials", e))?;

    let record = state
        .engine
        .run_compiled(
            &compiled.workflow,
            &compiled.graph,
            RunOptions {
                input,
                mode,
                credentials,
                cancel: None,
            },
        )
        .await;

    if let Err(e) = state.history.append(&record).await {
        tracing::error!("❌ Failed to store run {}: {}", record.run_id, e);
    }
    Ok(record)
}

/// POST /api/workflows/{id}/runs
/// Body: { "input": {...}, "mode": "simulate" | "live" }
async fn run_stored_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<RunRequest>>,
) -> Result<Json<RunRecord>, ApiError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let compiled = state
        .registry
        .get_workflow(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", id)))?;

    tracing::info!("▶️ Run requested for workflow {} ({} mode)", id, request.mode);
    let record = execute_and_record(&state, &compiled, request.input, request.mode).await?;
    Ok(Json(record))
}

/// POST /api/runs
/// Body: { "workflow": {...}, "input": {...}, "mode": "simulate" | "live" }
async fn run_ad_hoc(
    State(state): State<AppState>,
    Json(payload): Json<AdHocRunRequest>,
) -> Result<Json<RunRecord>, ApiError> {
    let compiled = CompiledWorkflow::compile(payload.workflow)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let record = execute_and_record(&state, &compiled, payload.input, payload.mode).await?;
    Ok(Json(record))
}

/// GET /api/workflows/{id}/runs?limit=N
async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let runs = state
        .history
        .list_for_workflow(&id, query.limit)
        .await
        .map_err(|e| internal("Failed to list runs", e))?;
    Ok(Json(runs))
}

/// GET /api/runs/{run_id}
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunRecord>, ApiError> {
    match state.history.get(run_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("run '{}' not found", run_id))),
        Err(e) => Err(internal("Failed to load run", e)),
    }
}

/// PUT /api/credentials/{name}
/// Body: { "value": "..." }
async fn put_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<CredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .storage
        .put_credential(&name, &payload.value)
        .await
        .map_err(|e| internal("Failed to store credential", e))?;
    tracing::info!("🔑 Stored credential '{}'", name);
    Ok(Json(json!({ "name": name, "message": "Credential stored" })))
}

/// DELETE /api/credentials/{name}
async fn delete_credential(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.storage.delete_credential(&name).await {
        Ok(true) => Ok(Json(json!({ "message": "Credential deleted" }))),
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("credential '{}' not found", name))),
        Err(e) => Err(internal("Failed to delete credential", e)),
    }
}
