/// Graph walker
///
/// Validates a workflow into a compiled graph, then walks it: repeatedly picks
/// the first ready node in declaration order, resolves its config, runs it
/// through the resilience wrapper and the matching invoker or control-flow
/// executor, records the result and publishes its output handles. Nested
/// constructs re-enter the same walker with a child context and a scoped key
/// prefix.

use crate::config::EngineConfig;
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::{ErrorDetail, InvocationError, NodeError};
use crate::runtime::invoker::{InvocationRequest, InvokerRegistry};
use crate::runtime::recovery::CircuitBreakers;
use crate::runtime::resilience::{self, Attempted, FailureNotice};
use crate::runtime::template::{self, PASSTHROUGH_KEYS};
use crate::runtime::trace::{NodeExecutionRecord, NodeStatus, RunFailure, RunRecord, RunStatus, TraceStore};
use crate::workflow::nodes::{CompiledGraph, CompiledNode, NodeKind};
use crate::workflow::types::{RunMode, WorkflowDefinition};
use crate::workflow::validate::{self, GraphValidationError};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a node produced and which handles it publishes on
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// Recorded output of the node
    pub value: Value,
    /// Selected handles; `None` publishes `value` on every non-error output
    pub routes: Option<Vec<(String, Value)>>,
}

impl NodeOutput {
    pub fn all(value: Value) -> Self {
        Self { value, routes: None }
    }

    /// Publish `value` on a single handle
    pub fn on(handle: impl Into<String>, value: Value) -> Self {
        Self {
            routes: Some(vec![(handle.into(), value.clone())]),
            value,
        }
    }

    pub fn routed(value: Value, routes: Vec<(String, Value)>) -> Self {
        Self {
            value,
            routes: Some(routes),
        }
    }
}

/// Options for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Initial data bag, visible to root nodes as `input`
    pub input: Value,
    pub mode: RunMode,
    /// Named secrets for `{{credential.*}}`
    pub credentials: HashMap<String, String>,
    /// Cancels the run when triggered
    pub cancel: Option<CancellationToken>,
}

/// State shared by every walker invocation of one run
#[derive(Debug)]
pub(crate) struct RunScope {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub mode: RunMode,
    pub trace: TraceStore,
}

/// Key prefix and cancellation token of one walker invocation
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    pub prefix: String,
    pub cancel: CancellationToken,
}

impl Scope {
    pub fn new(prefix: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            prefix: prefix.into(),
            cancel,
        }
    }

    /// Trace key of a node walked in this scope
    pub fn key(&self, node_id: &str) -> String {
        if self.prefix.is_empty() {
            node_id.to_string()
        } else {
            format!("{}/{}", self.prefix, node_id)
        }
    }

    /// Nested scope sharing this scope's cancellation
    pub fn nested(&self, prefix: impl Into<String>) -> Self {
        Self::new(prefix, self.cancel.clone())
    }
}

/// The node that ended a walk, and why
#[derive(Debug)]
pub(crate) struct WalkFailure {
    pub key: String,
    pub node_id: String,
    pub error: NodeError,
}

impl WalkFailure {
    /// Error the enclosing construct fails with
    pub fn into_node_error(self) -> NodeError {
        match self.error {
            NodeError::Cancelled => NodeError::Cancelled,
            error => NodeError::child(self.key, error),
        }
    }
}

/// Workflow execution engine
///
/// Cheap to clone; circuit-breaker state is shared by all clones and runs.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    pub(crate) invokers: Arc<InvokerRegistry>,
    pub(crate) http: reqwest::Client,
    pub(crate) breakers: Arc<CircuitBreakers>,
    pub(crate) config: EngineConfig,
    env: Arc<HashMap<String, String>>,
}

impl ExecutionEngine {
    /// Create an engine around an invoker registry
    ///
    /// The process environment is captured for `{{env.*}}`.
    pub fn new(invokers: InvokerRegistry, http: reqwest::Client, config: EngineConfig) -> Self {
        Self {
            invokers: Arc::new(invokers),
            http,
            breakers: Arc::new(CircuitBreakers::default()),
            config,
            env: Arc::new(std::env::vars().collect()),
        }
    }

    /// Engine with every built-in capability registered
    pub fn with_builtins(config: EngineConfig) -> Self {
        let http = reqwest::Client::new();
        Self::new(InvokerRegistry::with_builtins(http.clone()), http, config)
    }

    /// Replace the environment map seen by `{{env.*}}`
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn invokers(&self) -> &InvokerRegistry {
        &self.invokers
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Validate and run a workflow
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
        mode: RunMode,
    ) -> Result<RunRecord, GraphValidationError> {
        self.run_with(
            workflow,
            RunOptions {
                input,
                mode,
                ..Default::default()
            },
        )
        .await
    }

    /// Validate and run a workflow with full options
    pub async fn run_with(
        &self,
        workflow: &WorkflowDefinition,
        options: RunOptions,
    ) -> Result<RunRecord, GraphValidationError> {
        let graph = validate::compile(workflow).map_err(|e| {
            tracing::error!("❌ Workflow '{}' rejected: {}", workflow.id, e);
            e
        })?;
        Ok(self.run_compiled(workflow, &graph, options).await)
    }

    /// Run an already compiled graph
    pub async fn run_compiled(
        &self,
        workflow: &WorkflowDefinition,
        graph: &CompiledGraph,
        options: RunOptions,
    ) -> RunRecord {
        let run = RunScope {
            run_id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            mode: options.mode,
            trace: TraceStore::new(),
        };
        let started_at = Utc::now();
        let run_start = std::time::Instant::now();
        tracing::info!(
            run_id = %run.run_id,
            "🚀 Starting workflow run: {} ({} mode, {} nodes)",
            workflow.id,
            run.mode,
            graph.nodes.len()
        );

        let mut ctx = ExecutionContext::new((*self.env).clone(), options.credentials)
            .with_locals([("input".to_string(), options.input.clone())]);
        let scope = Scope::new("", options.cancel.unwrap_or_default());
        let outcome = self.walk(&run, graph, &mut ctx, &scope).await;

        let (status, failure) = match outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(failure) => {
                let status = match failure.error {
                    NodeError::Cancelled => RunStatus::Aborted,
                    _ => RunStatus::Failed,
                };
                (status, Some(RunFailure::from_error(&failure.node_id, &failure.error)))
            }
        };
        match status {
            RunStatus::Succeeded => tracing::info!(
                run_id = %run.run_id,
                "🎉 Workflow '{}' completed successfully in {:?}",
                workflow.id,
                run_start.elapsed()
            ),
            _ => tracing::error!(
                run_id = %run.run_id,
                "❌ Workflow '{}' {} after {:?}",
                workflow.id,
                status,
                run_start.elapsed()
            ),
        }

        let outputs: Map<String, Value> = ctx
            .outputs()
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();

        RunRecord {
            run_id: run.run_id,
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            mode: run.mode,
            status,
            started_at,
            finished_at: Some(Utc::now()),
            input: options.input,
            nodes: run.trace.records(),
            outputs,
            failure,
        }
    }

    /// Walk `graph` in `ctx` until no node is ready or a node fails unhandled
    pub(crate) fn walk<'a>(
        &'a self,
        run: &'a RunScope,
        graph: &'a CompiledGraph,
        ctx: &'a mut ExecutionContext,
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<(), WalkFailure>> {
        async move {
            let scope_input = ctx.local("input").cloned().unwrap_or(Value::Null);
            let mut started = vec![false; graph.nodes.len()];

            let outcome = loop {
                let next = (0..graph.nodes.len())
                    .find(|position| !started[*position] && is_ready(graph, *position, ctx));
                if scope.cancel.is_cancelled() {
                    // Blame the node that would have run next
                    let pending = next
                        .or_else(|| started.iter().position(|done| !*done))
                        .or_else(|| graph.nodes.len().checked_sub(1));
                    break Err(match pending {
                        Some(position) => {
                            let id = graph.nodes[position].id();
                            WalkFailure {
                                key: scope.key(id),
                                node_id: id.to_string(),
                                error: NodeError::Cancelled,
                            }
                        }
                        None => WalkFailure {
                            key: scope.prefix.clone(),
                            node_id: scope.prefix.clone(),
                            error: NodeError::Cancelled,
                        },
                    });
                }
                let Some(position) = next else {
                    break Ok(());
                };
                started[position] = true;

                let input = if graph.is_root(position) {
                    scope_input.clone()
                } else {
                    node_input(graph, position, ctx)
                };
                if let Err(failure) = self.run_node(run, graph, position, ctx, scope, input).await {
                    break Err(failure);
                }
            };

            for (position, node) in graph.nodes.iter().enumerate() {
                if !started[position] {
                    run.trace.skip(&scope.key(node.id()), &node.def);
                }
            }
            ctx.set_local("input", scope_input);
            outcome
        }
        .boxed()
    }

    async fn run_node(
        &self,
        run: &RunScope,
        graph: &CompiledGraph,
        position: usize,
        ctx: &mut ExecutionContext,
        scope: &Scope,
        input: Value,
    ) -> Result<(), WalkFailure> {
        let node = &graph.nodes[position];
        let key = scope.key(node.id());

        let mut record = NodeExecutionRecord::pending(key.clone(), &node.def);
        record.status = NodeStatus::Running;
        record.started_at = Some(Utc::now());
        record.input = Some(input.clone());
        run.trace.upsert(record.clone());
        tracing::debug!(run_id = %run.run_id, node_id = %key, "📍 Executing node '{}' (type: {})", key, node.def.node_type);

        ctx.set_local("input", input.clone());
        let attempted = self.execute_node(run, node, &key, ctx, scope, &input).await;
        record.attempts = attempted.attempts;
        record.finished_at = Some(Utc::now());

        let error = match attempted.result {
            Ok(output) => {
                record.status = NodeStatus::Succeeded;
                record.output = Some(output.value.clone());
                run.trace.upsert(record);

                let ports = match output.routes {
                    Some(routes) => routes,
                    None => node
                        .outputs
                        .iter()
                        .filter(|handle| handle.as_str() != "error")
                        .map(|handle| (handle.clone(), output.value.clone()))
                        .collect(),
                };
                ctx.publish(node.id(), output.value, ports);
                tracing::info!(run_id = %run.run_id, node_id = %key, "✅ Node '{}' completed", key);
                return Ok(());
            }
            Err(error) => error,
        };

        let detail = ErrorDetail::from(&error);
        record.status = NodeStatus::Failed;
        record.error = Some(detail.clone());
        let cancelled = matches!(error, NodeError::Cancelled);

        if !cancelled {
            if let Some(raw) = node.def.on_error_webhook_raw() {
                let notice = FailureNotice::new(node.id(), node.def.display_name(), &error, ctx.snapshot());
                resilience::fire_error_webhook(
                    &self.http,
                    &raw,
                    ctx,
                    notice,
                    run.mode,
                    Duration::from_millis(self.config.webhook_timeout_ms),
                );
            }
        }

        if !cancelled && graph.error_handle_connected(node.id()) {
            record.handled = true;
            run.trace.upsert(record);
            tracing::warn!(
                run_id = %run.run_id,
                node_id = %key,
                "⚠️ Node '{}' failed, routing to its error handle: {}",
                key,
                detail.message
            );
            let payload = error_payload(node.id(), &detail);
            ctx.publish(
                node.id(),
                json!({ "error": payload.clone() }),
                vec![("error".to_string(), payload)],
            );
            return Ok(());
        }

        run.trace.upsert(record);
        tracing::error!(run_id = %run.run_id, node_id = %key, "❌ Node '{}' failed: {}", key, error);
        Err(WalkFailure {
            key,
            node_id: node.id().to_string(),
            error,
        })
    }

    /// Run a node through the resilience wrapper
    async fn execute_node(
        &self,
        run: &RunScope,
        node: &CompiledNode,
        key: &str,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
    ) -> Attempted<NodeOutput> {
        let policy = node.def.retry_policy();
        let cancel = &scope.cancel;
        match &node.kind {
            NodeKind::Trigger | NodeKind::Action | NodeKind::Unknown(_) => {
                let timeout = Duration::from_millis(
                    node.def.timeout_ms.unwrap_or(self.config.node_timeout_ms),
                );
                resilience::run_with_retry(key, policy.as_ref(), Some(timeout), cancel, move |_| {
                    self.invoke_capability(run, node, ctx, input, cancel)
                })
                .await
            }
            _ => {
                resilience::run_with_retry(key, policy.as_ref(), None, cancel, move |_| {
                    self.execute_control(run, node, key, ctx, scope, input)
                })
                .await
            }
        }
    }

    async fn invoke_capability(
        &self,
        run: &RunScope,
        node: &CompiledNode,
        ctx: &ExecutionContext,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput, NodeError> {
        let config = template::resolve_config(&node.def.config, ctx, PASSTHROUGH_KEYS)?;
        let invoker = self.invokers.resolve(&node.def.node_type, run.mode);
        let value = invoker
            .invoke(InvocationRequest {
                node_id: node.id(),
                node_type: &node.def.node_type,
                config: &config,
                input,
                mode: run.mode,
                cancel,
            })
            .await?;
        Ok(NodeOutput::all(value))
    }

    /// Dispatch structured nodes to their executors
    async fn execute_control(
        &self,
        run: &RunScope,
        node: &CompiledNode,
        key: &str,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
    ) -> Result<NodeOutput, NodeError> {
        match &node.kind {
            NodeKind::Branch(config) => crate::runtime::control::branch::evaluate_branch(key, config, ctx, input),
            NodeKind::ForEach { config, body } => {
                self.run_for_each(run, key, config, body, ctx, scope, input).await
            }
            NodeKind::While { config, body } => {
                self.run_while(run, key, config, body, ctx, scope, input).await
            }
            NodeKind::Parallel { config, branches } => {
                self.run_parallel(run, key, config, branches, ctx, scope).await
            }
            NodeKind::SubFlow { config, body } => {
                self.run_sub_flow(run, key, config, body, ctx, scope).await
            }
            NodeKind::Recovery {
                config,
                protected,
                fallback,
            } => {
                self.run_recovery(run, key, config, protected, fallback.as_deref(), ctx, scope, input)
                    .await
            }
            NodeKind::Trigger | NodeKind::Action | NodeKind::Unknown(_) => Err(
                InvocationError::internal(format!("node '{}' is not a control-flow node", key)).into(),
            ),
        }
    }
}

/// Error payload published on a node's `error` handle
pub(crate) fn error_payload(node_id: &str, detail: &ErrorDetail) -> Value {
    let mut payload = json!({
        "nodeId": node_id,
        "kind": detail.kind,
        "message": detail.message,
    });
    if let Some(code) = detail.status_code {
        payload["statusCode"] = json!(code);
    }
    payload
}

/// Roots are ready until they run; other nodes once every wired input is published
fn is_ready(graph: &CompiledGraph, position: usize, ctx: &ExecutionContext) -> bool {
    if graph.is_root(position) {
        return true;
    }
    let mut incoming = graph.incoming(position).peekable();
    incoming.peek().is_some()
        && incoming.all(|c| ctx.port(&c.source_node_id, &c.source_handle).is_some())
}

/// Value of the single wired input handle, or an object keyed by handle
fn node_input(graph: &CompiledGraph, position: usize, ctx: &ExecutionContext) -> Value {
    let mut by_handle: Vec<(&str, Value)> = graph
        .incoming(position)
        .map(|c| {
            let value = ctx
                .port(&c.source_node_id, &c.source_handle)
                .cloned()
                .unwrap_or(Value::Null);
            (c.target_handle.as_str(), value)
        })
        .collect();
    if by_handle.len() == 1 {
        return by_handle.pop().map(|(_, value)| value).unwrap_or(Value::Null);
    }
    Value::Object(
        by_handle
            .into_iter()
            .map(|(handle, value)| (handle.to_string(), value))
            .collect(),
    )
}
