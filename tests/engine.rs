use async_trait::async_trait;
use kairo::config::EngineConfig;
use kairo::runtime::{
    CapabilityInvoker, ExecutionEngine, InvocationError, InvocationRequest, InvokerRegistry,
    NodeStatus, RunOptions, RunStatus,
};
use kairo::workflow::{RunMode, WorkflowDefinition};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn workflow(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        node_timeout_ms: 5_000,
        webhook_timeout_ms: 2_000,
        max_parallelism: 16,
    }
}

fn engine(registry: InvokerRegistry) -> ExecutionEngine {
    ExecutionEngine::new(registry, reqwest::Client::new(), engine_config())
}

fn builtins() -> ExecutionEngine {
    ExecutionEngine::with_builtins(engine_config())
}

/// Fails every call with HTTP 503 and remembers when it was called
#[derive(Default)]
struct Unavailable {
    calls: Mutex<Vec<Instant>>,
}

#[async_trait]
impl CapabilityInvoker for Unavailable {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        self.calls.lock().unwrap().push(Instant::now());
        Err(InvocationError::from_status(503, "service unavailable"))
    }
}

/// Fails when the input equals `config.failOn`, echoes it otherwise
struct FailOn;

#[async_trait]
impl CapabilityInvoker for FailOn {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        if request.config.get("failOn") == Some(request.input) {
            return Err(InvocationError::validation(format!("rejected {}", request.input)));
        }
        Ok(json!({ "accepted": request.input }))
    }
}

#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
}

#[async_trait]
impl CapabilityInvoker for Counter {
    async fn invoke(&self, _request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!(n))
    }
}

#[tokio::test]
async fn linear_run_resolves_templates_between_nodes() {
    let wf = workflow(json!({
        "id": "wf-linear",
        "name": "linear",
        "nodes": [
            { "id": "start", "type": "manualTrigger" },
            { "id": "shout", "type": "toUpperCase", "config": { "text": "hello {{start.name}}" } },
            { "id": "log", "type": "logMessage", "config": { "message": "{{shout}}" } }
        ],
        "connections": [
            { "sourceNodeId": "start", "targetNodeId": "shout" },
            { "sourceNodeId": "shout", "targetNodeId": "log" }
        ]
    }));

    let record = builtins()
        .run(&wf, json!({ "name": "ada" }), RunMode::Simulate)
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["shout"], json!("HELLO ADA"));
    assert_eq!(record.outputs["log"]["message"], json!("HELLO ADA"));
    assert!(record.nodes.iter().all(|n| n.status == NodeStatus::Succeeded));
    assert!(record.failure.is_none());
}

#[tokio::test]
async fn invalid_graph_is_rejected_before_running() {
    let wf = workflow(json!({
        "id": "wf-cycle",
        "nodes": [
            { "id": "a", "type": "logMessage" },
            { "id": "b", "type": "logMessage" }
        ],
        "connections": [
            { "sourceNodeId": "a", "targetNodeId": "b" },
            { "sourceNodeId": "b", "targetNodeId": "a" }
        ]
    }));
    assert!(builtins().run(&wf, Value::Null, RunMode::Simulate).await.is_err());
}

#[tokio::test]
async fn unresolved_placeholder_fails_the_node() {
    let wf = workflow(json!({
        "id": "wf-missing",
        "nodes": [
            { "id": "log", "type": "logMessage", "config": { "message": "{{nowhere.value}}" } }
        ]
    }));
    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.node_id, "log");
    assert_eq!(failure.kind, "ConfigResolutionError");
    assert_eq!(record.node("log").unwrap().attempts, 1);
}

#[tokio::test]
async fn retries_wait_with_exponential_backoff() {
    let flaky = Arc::new(Unavailable::default());
    let registry = InvokerRegistry::new().with("crm", flaky.clone());
    let wf = workflow(json!({
        "id": "wf-retry",
        "nodes": [{
            "id": "call",
            "type": "crm",
            "retry": { "attempts": 3, "delayMs": 100, "backoffFactor": 2 }
        }]
    }));

    let record = engine(registry).run(&wf, Value::Null, RunMode::Live).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let node = record.node("call").unwrap();
    assert_eq!(node.attempts, 3);
    assert_eq!(node.error.as_ref().unwrap().status_code, Some(503));
    assert_eq!(record.failure.unwrap().kind, "InvocationError.upstream_5xx");

    let calls = flaky.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(100));
    assert!(calls[2] - calls[1] >= Duration::from_millis(200));
}

#[tokio::test]
async fn retry_filters_skip_non_matching_errors() {
    let flaky = Arc::new(Unavailable::default());
    let registry = InvokerRegistry::new().with("crm", flaky.clone());
    let wf = workflow(json!({
        "id": "wf-filter",
        "nodes": [{
            "id": "call",
            "type": "crm",
            "retry": { "attempts": 4, "delayMs": 10, "retryOnStatusCodes": [429] }
        }]
    }));

    let record = engine(registry).run(&wf, Value::Null, RunMode::Live).await.unwrap();
    assert_eq!(record.node("call").unwrap().attempts, 1);
    assert_eq!(flaky.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn simulate_mode_never_reaches_side_effecting_invokers() {
    let flaky = Arc::new(Unavailable::default());
    let registry = InvokerRegistry::new().with("crm", flaky.clone());
    let wf = workflow(json!({
        "id": "wf-sim",
        "nodes": [{
            "id": "call",
            "type": "crm",
            "config": { "simulatedResponse": { "id": 42 } }
        }]
    }));

    let record = engine(registry).run(&wf, Value::Null, RunMode::Simulate).await.unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["call"], json!({ "id": 42 }));
    assert!(flaky.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn branch_routes_to_first_matching_handle() {
    let wf = workflow(json!({
        "id": "wf-branch",
        "nodes": [
            {
                "id": "route",
                "type": "conditionalBranch",
                "config": {
                    "conditions": [
                        { "id": "large", "expression": "> 10" },
                        { "id": "medium", "expression": "> 5" }
                    ]
                }
            },
            { "id": "big", "type": "logMessage", "config": { "message": "big" } },
            { "id": "mid", "type": "logMessage", "config": { "message": "mid {{input}}" } },
            { "id": "small", "type": "logMessage", "config": { "message": "small" } }
        ],
        "connections": [
            { "sourceNodeId": "route", "sourceHandle": "large", "targetNodeId": "big" },
            { "sourceNodeId": "route", "sourceHandle": "medium", "targetNodeId": "mid" },
            { "sourceNodeId": "route", "sourceHandle": "else", "targetNodeId": "small" }
        ]
    }));

    let record = builtins().run(&wf, json!(7), RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.node("mid").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(record.outputs["mid"]["message"], json!("mid 7"));
    assert_eq!(record.node("big").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.node("small").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn connected_error_handle_keeps_the_run_alive() {
    let wf = workflow(json!({
        "id": "wf-error-handle",
        "nodes": [
            {
                "id": "fetch",
                "type": "httpRequest",
                "config": {
                    "url": "https://example.invalid",
                    "simulatedError": { "message": "bad gateway", "statusCode": 502 }
                }
            },
            { "id": "after", "type": "logMessage", "config": { "message": "never" } },
            { "id": "handler", "type": "logMessage", "config": { "message": "{{input.message}}" } }
        ],
        "connections": [
            { "sourceNodeId": "fetch", "targetNodeId": "after" },
            { "sourceNodeId": "fetch", "sourceHandle": "error", "targetNodeId": "handler" }
        ]
    }));

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    let fetch = record.node("fetch").unwrap();
    assert_eq!(fetch.status, NodeStatus::Failed);
    assert!(fetch.handled);

    let handler = record.node("handler").unwrap();
    assert_eq!(handler.status, NodeStatus::Succeeded);
    assert_eq!(handler.input.as_ref().unwrap()["nodeId"], json!("fetch"));
    assert_eq!(handler.input.as_ref().unwrap()["statusCode"], json!(502));
    assert_eq!(record.outputs["handler"]["message"], json!("bad gateway"));
    assert_eq!(record.node("after").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn for_each_continues_past_failed_items() {
    let registry = InvokerRegistry::new().with("validate", Arc::new(FailOn));
    let wf = workflow(json!({
        "id": "wf-each",
        "nodes": [{
            "id": "loop",
            "type": "forEachLoop",
            "config": {
                "continueOnError": true,
                "nodes": [{ "id": "check", "type": "validate", "config": { "failOn": 2 } }]
            }
        }]
    }));

    let record = engine(registry).run(&wf, json!([1, 2, 3]), RunMode::Live).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    let output = &record.outputs["loop"];
    assert_eq!(output["summary"], json!({ "total": 3, "succeeded": 2, "failed": 1 }));
    assert_eq!(output["results"][0], json!({ "accepted": 1 }));
    assert_eq!(output["results"][1]["index"], json!(1));
    assert_eq!(output["results"][2], json!({ "accepted": 3 }));
    assert_eq!(output["errors"][0]["index"], json!(1));

    assert_eq!(record.node("loop[1]/check").unwrap().status, NodeStatus::Failed);
    assert_eq!(record.node("loop[2]/check").unwrap().status, NodeStatus::Succeeded);
}

#[tokio::test]
async fn for_each_failure_names_the_iteration() {
    let registry = InvokerRegistry::new().with("validate", Arc::new(FailOn));
    let wf = workflow(json!({
        "id": "wf-each-strict",
        "nodes": [{
            "id": "loop",
            "type": "forEachLoop",
            "config": {
                "items": "{{input.orders}}",
                "nodes": [{ "id": "check", "type": "validate", "config": { "failOn": "b" } }]
            }
        }]
    }));

    let record = engine(registry)
        .run(&wf, json!({ "orders": ["a", "b", "c"] }), RunMode::Live)
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.node_id, "loop");
    assert_eq!(failure.kind, "InvocationError.validation");
    assert!(failure.chain.contains(&"loop[1]/check".to_string()));
    assert!(record.node("loop[2]/check").is_none());
}

#[tokio::test]
async fn while_loop_hits_its_safety_limit() {
    let counter = Arc::new(Counter::default());
    let registry = InvokerRegistry::new().with("tick", counter.clone());
    let wf = workflow(json!({
        "id": "wf-while",
        "nodes": [{
            "id": "spin",
            "type": "whileLoop",
            "config": {
                "condition": "true",
                "maxIterations": 5,
                "nodes": [{ "id": "tick", "type": "tick" }]
            }
        }]
    }));

    let record = engine(registry).run(&wf, Value::Null, RunMode::Live).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure.as_ref().unwrap().kind, "SafetyLimitExceeded");
    assert_eq!(counter.calls.load(Ordering::SeqCst), 5);
    assert_eq!(record.records_for("tick").count(), 5);
}

#[tokio::test]
async fn while_loop_stops_on_break_condition() {
    let wf = workflow(json!({
        "id": "wf-while-break",
        "nodes": [{
            "id": "poll",
            "type": "whileLoop",
            "config": {
                "condition": "{{state.status}} != 'done'",
                "stateVariables": { "status": "pending" },
                "breakCondition": "{{iteration_count}} >= 3",
                "nodes": [{ "id": "log", "type": "logMessage", "config": { "message": "tick {{iteration_count}}" } }]
            }
        }]
    }));

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    let output = &record.outputs["poll"];
    assert_eq!(output["iterations_completed"], json!(3));
    assert_eq!(output["break_reason"], json!("break_condition"));
    assert_eq!(output["final_state"], json!({ "status": "pending" }));
    assert_eq!(record.node("poll[0]/log").unwrap().output.as_ref().unwrap()["message"], json!("tick 0"));
}

fn fan_out(concurrency_limit: u64) -> WorkflowDefinition {
    workflow(json!({
        "id": "wf-parallel",
        "nodes": [{
            "id": "fan",
            "type": "parallelExecution",
            "config": {
                "concurrencyLimit": concurrency_limit,
                "branches": [
                    { "id": "a", "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 300 } }] },
                    { "id": "b", "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 300 } }] }
                ]
            }
        }]
    }))
}

#[tokio::test]
async fn parallel_branches_respect_the_concurrency_limit() {
    let engine = builtins();

    let started = Instant::now();
    let serial = engine.run(&fan_out(1), json!("x"), RunMode::Simulate).await.unwrap();
    let serial_elapsed = started.elapsed();

    let started = Instant::now();
    let concurrent = engine.run(&fan_out(0), json!("x"), RunMode::Simulate).await.unwrap();
    let concurrent_elapsed = started.elapsed();

    assert_eq!(serial.status, RunStatus::Succeeded);
    assert_eq!(concurrent.status, RunStatus::Succeeded);
    assert!(serial_elapsed >= Duration::from_millis(600));
    assert!(concurrent_elapsed < Duration::from_millis(550));

    let output = &concurrent.outputs["fan"];
    assert_eq!(output["results"], json!({ "a": "x", "b": "x" }));
    assert_eq!(output["summary"]["succeeded"], json!(2));
    assert!(concurrent.node("fan[a]/wait").is_some());
    assert!(concurrent.node("fan[b]/wait").is_some());
}

#[tokio::test]
async fn parallel_fail_fast_fails_the_node() {
    let wf = workflow(json!({
        "id": "wf-parallel-ff",
        "nodes": [{
            "id": "fan",
            "type": "parallelExecution",
            "config": {
                "failureHandling": "fail-fast",
                "branches": [
                    { "id": "slow", "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 2000 } }] },
                    { "id": "bad", "nodes": [{
                        "id": "call",
                        "type": "httpRequest",
                        "config": { "url": "https://example.invalid", "simulatedStatusCode": 500 }
                    }] }
                ]
            }
        }]
    }));

    let started = Instant::now();
    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure.unwrap().kind, "InvocationError.upstream_5xx");
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn sub_flow_only_sees_mapped_values() {
    let wf = workflow(json!({
        "id": "wf-sub",
        "nodes": [
            { "id": "outer", "type": "logMessage", "config": { "message": "secret" } },
            {
                "id": "group",
                "type": "executeFlowGroup",
                "config": {
                    "inputMapping": { "greeting": "hi {{outer.message}}" },
                    "nodes": [{ "id": "shout", "type": "toUpperCase", "config": { "text": "{{greeting}}" } }]
                }
            },
            {
                "id": "leaky",
                "type": "executeFlowGroup",
                "config": {
                    "nodes": [{ "id": "peek", "type": "logMessage", "config": { "message": "{{outer.message}}" } }]
                }
            }
        ],
        "connections": [
            { "sourceNodeId": "outer", "targetNodeId": "group" },
            { "sourceNodeId": "group", "targetNodeId": "leaky" }
        ]
    }));

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.outputs["group"], json!("HI SECRET"));
    assert_eq!(record.status, RunStatus::Failed);
    let failure = record.failure.unwrap();
    assert_eq!(failure.node_id, "leaky");
    assert_eq!(failure.kind, "ConfigResolutionError");
}

#[tokio::test]
async fn cancelling_a_run_aborts_it() {
    let wf = workflow(json!({
        "id": "wf-cancel",
        "nodes": [
            { "id": "wait", "type": "delay", "config": { "delayMs": 5000 } },
            { "id": "after", "type": "logMessage", "config": { "message": "late" } }
        ],
        "connections": [{ "sourceNodeId": "wait", "targetNodeId": "after" }]
    }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let record = builtins()
        .run_with(
            &wf,
            RunOptions {
                input: Value::Null,
                mode: RunMode::Simulate,
                credentials: Default::default(),
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Aborted);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(record.node("wait").unwrap().status, NodeStatus::Failed);
    assert_eq!(record.node("after").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn credentials_resolve_from_run_options() {
    let wf = workflow(json!({
        "id": "wf-credentials",
        "nodes": [
            { "id": "log", "type": "logMessage", "config": { "message": "key={{credential.stripe}}" } }
        ]
    }));

    let record = builtins()
        .run_with(
            &wf,
            RunOptions {
                credentials: [("stripe".to_string(), "sk_test".to_string())].into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.outputs["log"]["message"], json!("key=sk_test"));
}

#[tokio::test]
async fn diamond_joins_run_each_node_once() {
    let wf = workflow(json!({
        "id": "wf-diamond",
        "nodes": [
            { "id": "join", "type": "concatenateStrings", "inputHandles": ["left", "right"],
              "config": { "strings": ["{{input.left}}", "{{input.right}}"], "separator": "+" } },
            { "id": "a", "type": "logMessage", "config": { "message": "a" } },
            { "id": "b", "type": "toUpperCase", "config": { "text": "b" } },
            { "id": "c", "type": "toUpperCase", "config": { "text": "c" } }
        ],
        "connections": [
            { "sourceNodeId": "a", "targetNodeId": "b" },
            { "sourceNodeId": "a", "targetNodeId": "c" },
            { "sourceNodeId": "b", "targetNodeId": "join", "targetHandle": "left" },
            { "sourceNodeId": "c", "targetNodeId": "join", "targetHandle": "right" }
        ]
    }));

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.nodes.len(), 4);
    for id in ["a", "b", "c", "join"] {
        assert_eq!(record.records_for(id).count(), 1);
    }
    assert_eq!(
        record.node("join").unwrap().input,
        Some(json!({ "left": "B", "right": "C" }))
    );
}

#[tokio::test]
async fn branch_with_unresolved_placeholder_fails() {
    let wf = workflow(json!({
        "id": "wf-branch-missing",
        "nodes": [
            {
                "id": "route",
                "type": "conditionalBranch",
                "config": {
                    "conditions": [{ "id": "gold", "expression": "{{customer.tier}} == 'gold'" }]
                }
            },
            { "id": "vip", "type": "logMessage", "config": { "message": "vip" } },
            { "id": "regular", "type": "logMessage", "config": { "message": "regular" } }
        ],
        "connections": [
            { "sourceNodeId": "route", "sourceHandle": "gold", "targetNodeId": "vip" },
            { "sourceNodeId": "route", "sourceHandle": "else", "targetNodeId": "regular" }
        ]
    }));

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.node_id, "route");
    assert_eq!(failure.kind, "ConfigResolutionError");
    assert_eq!(record.node("route").unwrap().status, NodeStatus::Failed);
    assert_eq!(record.node("regular").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn while_loop_timeout_is_a_safety_limit() {
    let wf = workflow(json!({
        "id": "wf-while-timeout",
        "nodes": [{
            "id": "spin",
            "type": "whileLoop",
            "config": {
                "condition": "true",
                "loopTimeoutMs": 250,
                "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 100 } }]
            }
        }]
    }));

    let started = Instant::now();
    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure.as_ref().unwrap().kind, "SafetyLimitExceeded");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(record.records_for("wait").count() < 10);
}

#[tokio::test]
async fn parallel_timeout_cancels_running_branches() {
    let wf = workflow(json!({
        "id": "wf-parallel-timeout",
        "nodes": [{
            "id": "fan",
            "type": "parallelExecution",
            "config": {
                "timeoutMs": 200,
                "branches": [
                    { "id": "a", "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 3000 } }] },
                    { "id": "b", "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 3000 } }] }
                ]
            }
        }]
    }));

    let started = Instant::now();
    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failure.as_ref().unwrap().kind, "SafetyLimitExceeded");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(record.node("fan[a]/wait").unwrap().status, NodeStatus::Failed);
    assert_eq!(record.node("fan[b]/wait").unwrap().status, NodeStatus::Failed);
}

#[tokio::test]
async fn for_each_iteration_timeout_fails_the_loop() {
    let wf = workflow(json!({
        "id": "wf-each-timeout",
        "nodes": [{
            "id": "loop",
            "type": "forEachLoop",
            "config": {
                "iterationTimeoutMs": 100,
                "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 3000 } }]
            }
        }]
    }));

    let started = Instant::now();
    let record = builtins().run(&wf, json!(["slow"]), RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let failure = record.failure.unwrap();
    assert_eq!(failure.node_id, "loop");
    assert_eq!(failure.kind, "SafetyLimitExceeded");
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn parallel_for_each_keeps_item_order() {
    let wf = workflow(json!({
        "id": "wf-each-parallel",
        "nodes": [{
            "id": "loop",
            "type": "forEachLoop",
            "config": {
                "parallelExecution": true,
                "maxConcurrency": 3,
                "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": "{{item}}" } }]
            }
        }]
    }));

    let started = Instant::now();
    let record = builtins()
        .run(&wf, json!([300, 100, 200]), RunMode::Simulate)
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["loop"]["results"], json!([300, 100, 200]));
    assert!(started.elapsed() < Duration::from_millis(550));
}

/// Parallel node whose branches wait `delayMs`, then parse `json` as their result
fn aggregating(aggregation: &str, branches: &[(&str, u64, &str)]) -> WorkflowDefinition {
    let branches: Vec<Value> = branches
        .iter()
        .map(|(id, delay_ms, text)| {
            json!({
                "id": id,
                "nodes": [
                    { "id": "wait", "type": "delay", "config": { "delayMs": delay_ms } },
                    { "id": "parse", "type": "parseJson", "config": { "jsonString": text } }
                ],
                "connections": [{ "sourceNodeId": "wait", "targetNodeId": "parse" }]
            })
        })
        .collect();
    workflow(json!({
        "id": format!("wf-{}", aggregation),
        "nodes": [{
            "id": "fan",
            "type": "parallelExecution",
            "config": { "resultAggregation": aggregation, "branches": branches }
        }]
    }))
}

#[tokio::test]
async fn parallel_merge_combines_branch_objects() {
    let wf = aggregating(
        "merge",
        &[("a", 0, r#"{"x": 1}"#), ("b", 0, r#"{"y": 2}"#), ("c", 0, "7")],
    );

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["fan"]["results"], json!({ "x": 1, "y": 2, "c": 7 }));
}

#[tokio::test]
async fn parallel_first_takes_declaration_order() {
    let wf = aggregating("first", &[("slow", 150, r#""A""#), ("quick", 0, r#""B""#)]);

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["fan"]["results"], json!("A"));
}

#[tokio::test]
async fn parallel_fastest_cancels_the_rest() {
    let wf = aggregating("fastest", &[("slow", 3000, r#""A""#), ("quick", 0, r#""B""#)]);

    let started = Instant::now();
    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["fan"]["results"], json!("B"));
    assert_eq!(record.outputs["fan"]["summary"]["succeeded"], json!(1));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn parallel_majority_picks_the_common_answer() {
    let wf = aggregating(
        "majority",
        &[("a", 0, r#""yes""#), ("b", 0, r#""no""#), ("c", 0, r#""yes""#)],
    );

    let record = builtins().run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["fan"]["results"], json!("yes"));
}

#[tokio::test]
async fn run_cancelled_before_start_names_the_pending_node() {
    let wf = workflow(json!({
        "id": "wf-cancel-early",
        "nodes": [{ "id": "first", "type": "logMessage", "config": { "message": "never" } }]
    }));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let record = builtins()
        .run_with(
            &wf,
            RunOptions {
                input: Value::Null,
                mode: RunMode::Simulate,
                credentials: Default::default(),
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Aborted);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.node_id, "first");
    assert_eq!(failure.kind, "Cancelled");
    assert_eq!(record.node("first").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn unlimited_fan_out_is_capped_by_engine_parallelism() {
    let engine = ExecutionEngine::with_builtins(EngineConfig {
        max_parallelism: 2,
        ..engine_config()
    });
    let branch = |id: &str| {
        json!({ "id": id, "nodes": [{ "id": "wait", "type": "delay", "config": { "delayMs": 200 } }] })
    };
    let wf = workflow(json!({
        "id": "wf-capped",
        "nodes": [{
            "id": "fan",
            "type": "parallelExecution",
            "config": { "concurrencyLimit": 0, "branches": [branch("a"), branch("b"), branch("c")] }
        }]
    }));

    let started = Instant::now();
    let record = engine.run(&wf, Value::Null, RunMode::Simulate).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.outputs["fan"]["summary"]["succeeded"], json!(3));
    assert!(started.elapsed() >= Duration::from_millis(400));
}
