use kairo::api::AppState;
use kairo::config::EngineConfig;
use kairo::runtime::ExecutionEngine;
use kairo::server::router;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;

/// Serve the full router on an ephemeral port backed by an in-memory database
async fn spawn_service() -> String {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let engine = ExecutionEngine::with_builtins(EngineConfig {
        node_timeout_ms: 5_000,
        webhook_timeout_ms: 2_000,
        max_parallelism: 8,
    });
    let state = AppState::connect(pool, engine).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn greeting_workflow() -> Value {
    json!({
        "id": "wf-greet",
        "name": "greet",
        "nodes": [
            { "id": "hook", "type": "webhookTrigger", "config": { "path": "/greet" } },
            { "id": "shout", "type": "toUpperCase", "config": { "text": "hi {{hook.requestBody.name}}" } }
        ],
        "connections": [{ "sourceNodeId": "hook", "targetNodeId": "shout" }]
    })
}

#[tokio::test]
async fn health_check_responds() {
    let base = spawn_service().await;
    let response = reqwest::get(format!("{}/healthz", base)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn workflow_crud_validates_and_conflicts() {
    let base = spawn_service().await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{}/api/workflows", base))
        .json(&json!({ "workflow": greeting_workflow() }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = client
        .post(format!("{}/api/workflows", base))
        .json(&json!({ "workflow": greeting_workflow() }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let cyclic = client
        .post(format!("{}/api/workflows", base))
        .json(&json!({ "workflow": {
            "id": "wf-cycle",
            "nodes": [
                { "id": "a", "type": "logMessage" },
                { "id": "b", "type": "logMessage" }
            ],
            "connections": [
                { "sourceNodeId": "a", "targetNodeId": "b" },
                { "sourceNodeId": "b", "targetNodeId": "a" }
            ]
        } }))
        .send()
        .await
        .unwrap();
    assert_eq!(cyclic.status(), StatusCode::BAD_REQUEST);

    let listed: Value = client
        .get(format!("{}/api/workflows", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["workflows"].as_array().unwrap().len(), 1);

    let fetched: Value = client
        .get(format!("{}/api/workflows/wf-greet", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], json!("greet"));

    let deleted = client
        .delete(format!("{}/api/workflows/wf-greet", base))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);

    let missing = client
        .get(format!("{}/api/workflows/wf-greet", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn runs_are_recorded_in_history() {
    let base = spawn_service().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/workflows", base))
        .json(&json!({ "workflow": greeting_workflow() }))
        .send()
        .await
        .unwrap();

    let run: Value = client
        .post(format!("{}/api/workflows/wf-greet/runs", base))
        .json(&json!({ "input": { "requestBody": { "name": "ada" } }, "mode": "simulate" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["status"], json!("succeeded"));
    assert_eq!(run["outputs"]["shout"], json!("HI ADA"));

    let history: Value = client
        .get(format!("{}/api/workflows/wf-greet/runs", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["runId"], run["runId"]);

    let stored: Value = client
        .get(format!("{}/api/runs/{}", base, run["runId"].as_str().unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["nodes"].as_array().unwrap().len(), 2);

    let unknown = client
        .post(format!("{}/api/workflows/nope/runs", base))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_requests_start_live_runs() {
    let base = spawn_service().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/workflows", base))
        .json(&json!({ "workflow": greeting_workflow() }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/webhook/wf-greet/greet?source=test", base))
        .json(&json!({ "name": "grace" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let run: Value = response.json().await.unwrap();
    assert_eq!(run["mode"], json!("live"));
    assert_eq!(run["outputs"]["shout"], json!("HI GRACE"));
    assert_eq!(run["outputs"]["hook"]["requestQuery"]["source"], json!("test"));
    assert_eq!(run["outputs"]["hook"]["requestMethod"], json!("POST"));

    let wrong_path = client
        .post(format!("{}/webhook/wf-greet/other", base))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_path.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ad_hoc_runs_use_stored_credentials() {
    let base = spawn_service().await;
    let client = reqwest::Client::new();

    let stored = client
        .put(format!("{}/api/credentials/stripe", base))
        .json(&json!({ "value": "sk_test" }))
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), StatusCode::OK);

    let run: Value = client
        .post(format!("{}/api/runs", base))
        .json(&json!({
            "workflow": {
                "id": "adhoc",
                "nodes": [{ "id": "log", "type": "logMessage", "config": { "message": "{{credential.stripe}}" } }]
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["status"], json!("succeeded"));
    assert_eq!(run["outputs"]["log"]["message"], json!("sk_test"));

    let removed = client
        .delete(format!("{}/api/credentials/stripe", base))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::OK);
}
