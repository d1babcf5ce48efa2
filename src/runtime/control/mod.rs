/// Control-flow executors
///
/// Structured nodes (branch, for-each, while, parallel, sub-flow) run their
/// embedded sub-graphs by re-entering the walker with a child context. Only the
/// aggregated result of a construct becomes visible to the enclosing graph.

pub mod branch;
pub mod for_each;
pub mod parallel;
pub mod sub_flow;
pub mod while_loop;

use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::{ExecutionEngine, RunScope, Scope, WalkFailure};
use crate::runtime::error::NodeError;
use crate::runtime::template;
use crate::workflow::nodes::CompiledGraph;
use serde_json::{Map, Value};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

impl ExecutionEngine {
    /// Walk `body` in `ctx` and compute the body's result value
    pub(crate) async fn run_body(
        &self,
        run: &RunScope,
        body: &CompiledGraph,
        mut ctx: ExecutionContext,
        scope: &Scope,
        output_source: Option<&str>,
    ) -> Result<Value, NodeError> {
        self.walk(run, body, &mut ctx, scope)
            .await
            .map_err(WalkFailure::into_node_error)?;
        body_result(&ctx, output_source)
    }
}

/// Result of a walked body: `outputSource` if set, else the last completed
/// node's output, else the body's input
pub(crate) fn body_result(
    ctx: &ExecutionContext,
    output_source: Option<&str>,
) -> Result<Value, NodeError> {
    match output_source.filter(|source| !source.trim().is_empty()) {
        Some(source) => Ok(template::resolve_str(source, ctx)?),
        None => Ok(ctx
            .last_output()
            .or_else(|| ctx.local("input"))
            .cloned()
            .unwrap_or(Value::Null)),
    }
}

/// Resolve every template of a name → template mapping
pub(crate) fn resolve_mapping(
    mapping: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, NodeError> {
    let mut resolved = Map::with_capacity(mapping.len());
    for (name, value) in mapping {
        resolved.insert(name.clone(), template::resolve_value(value, ctx)?);
    }
    Ok(resolved)
}

/// Run `work` under an optional deadline
///
/// On expiry `cancel` is triggered and `work` is driven to completion so nested
/// records settle, then `on_timeout` is reported.
pub(crate) async fn with_deadline<T, Fut>(
    limit: Option<Duration>,
    cancel: &CancellationToken,
    work: Fut,
    on_timeout: impl FnOnce() -> NodeError,
) -> Result<T, NodeError>
where
    Fut: Future<Output = Result<T, NodeError>>,
{
    let Some(limit) = limit else {
        return work.await;
    };
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = tokio::time::sleep(limit) => {
            cancel.cancel();
            let _ = work.await;
            Err(on_timeout())
        }
    }
}
