/// Dynamic webhook execution endpoints
///
/// Requests to `/webhook/{workflow_id}/{path}` start a live run of the workflow
/// whose `webhookTrigger` path matches. The request becomes the run input as
/// `{requestBody, requestHeaders, requestQuery, requestMethod}`.

use crate::{
    api::{
        runs::execute_and_record,
        workflows::{api_error, ApiError, AppState},
    },
    runtime::trace::{RunRecord, RunStatus},
    workflow::types::RunMode,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::Json,
    routing::{any, Router},
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Create the catch-all webhook route
///
/// Format: /webhook/{workflow_id}/{webhook_path}
pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{workflow_id}/{*path}", any(execute_webhook))
}

/// Body as JSON when it parses, as text otherwise
fn request_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn request_headers(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), json!(value));
        }
    }
    Value::Object(map)
}

/// Execute a workflow via webhook trigger
///
/// Responds 200 with the run record when the run succeeded, 422 otherwise.
async fn execute_webhook(
    State(state): State<AppState>,
    Path((workflow_id, webhook_path)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<RunRecord>), ApiError> {
    tracing::info!("📥 Webhook request received: {} {}/{}", method, workflow_id, webhook_path);

    let compiled = state.registry.get_workflow(&workflow_id).ok_or_else(|| {
        tracing::warn!("❌ Webhook called for unknown workflow: {}", workflow_id);
        api_error(StatusCode::NOT_FOUND, format!("workflow '{}' not found", workflow_id))
    })?;
    if !compiled.accepts_webhook(&webhook_path) {
        tracing::warn!(
            "❌ No webhook trigger for path '{}' in workflow '{}' (available: {:?})",
            webhook_path,
            workflow_id,
            compiled.webhook_paths
        );
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no webhook trigger for path '{}'", webhook_path),
        ));
    }

    let input = json!({
        "requestBody": request_body(&body),
        "requestHeaders": request_headers(&headers),
        "requestQuery": query,
        "requestMethod": method.as_str(),
    });
    let record = execute_and_record(&state, &compiled, input, RunMode::Live).await?;

    let status = match record.status {
        RunStatus::Succeeded => StatusCode::OK,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(record)))
}
