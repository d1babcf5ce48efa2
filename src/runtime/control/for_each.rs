/// For-each executor
///
/// Runs the loop body once per item, sequentially or with bounded concurrency,
/// each iteration in its own child context with `item`, `index` and `input`
/// bound. Results come back in item order regardless of completion order.

use crate::runtime::context::ExecutionContext;
use crate::runtime::control::with_deadline;
use crate::runtime::engine::{ExecutionEngine, NodeOutput, RunScope, Scope};
use crate::runtime::error::{ConfigResolutionError, ErrorDetail, NodeError};
use crate::runtime::resilience;
use crate::runtime::template;
use crate::workflow::nodes::{CompiledGraph, ForEachConfig};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Turn the resolved `items` value into the list to iterate
fn item_list(items: Value) -> Result<Vec<Value>, ConfigResolutionError> {
    match items {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::String(text) => serde_json::from_str::<Vec<Value>>(&text).map_err(|_| {
            ConfigResolutionError::InvalidConfig(format!(
                "forEach items must be an array, got text '{}'",
                text
            ))
        }),
        other => Err(ConfigResolutionError::InvalidConfig(format!(
            "forEach items must be an array, got {}",
            other
        ))),
    }
}

fn is_empty_item(item: &Value) -> bool {
    match item {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_for_each(
        &self,
        run: &RunScope,
        key: &str,
        config: &ForEachConfig,
        body: &CompiledGraph,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
    ) -> Result<NodeOutput, NodeError> {
        let items = match &config.items {
            Some(items) => template::resolve_value(items, ctx)?,
            None => input.clone(),
        };
        let items: Vec<(usize, Value)> = item_list(items)?
            .into_iter()
            .enumerate()
            .filter(|(_, item)| !(config.skip_empty_items && is_empty_item(item)))
            .collect();
        let total = items.len();
        let concurrency = if config.parallel_execution {
            config.max_concurrency.min(self.config.max_parallelism).max(1)
        } else {
            1
        };
        tracing::info!(
            "🔁 Loop '{}' over {} items (concurrency {})",
            key,
            total,
            concurrency
        );

        let loop_cancel = scope.cancel.child_token();
        let delay = Duration::from_millis(config.delay_between_iterations_ms);
        let mut outcomes: Vec<Option<(usize, Result<Value, NodeError>)>> = vec![None; total];
        let mut first_failure: Option<NodeError> = None;

        let spawn_cancel = loop_cancel.clone();
        let mut iterations = stream::iter(items.into_iter().enumerate())
            .map(move |(slot, (index, item))| {
                let cancel = spawn_cancel.clone();
                async move {
                    if slot > 0 && !resilience::backoff(delay, &cancel).await {
                        return (slot, index, Err(NodeError::Cancelled));
                    }
                    let result = self
                        .run_iteration(run, key, config, body, ctx, index, item, cancel)
                        .await;
                    (slot, index, result)
                }
            })
            .buffer_unordered(concurrency);

        while let Some((slot, index, result)) = iterations.next().await {
            if let Err(error) = &result {
                if !config.continue_on_error && first_failure.is_none() {
                    tracing::error!("❌ Loop '{}' iteration {} failed, stopping", key, index);
                    first_failure = Some(error.clone());
                    loop_cancel.cancel();
                }
            }
            outcomes[slot] = Some((index, result));
        }
        drop(iterations);

        if scope.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        if let Some(error) = first_failure {
            return Err(error);
        }

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();
        for (index, result) in outcomes.into_iter().flatten() {
            match result {
                Ok(value) => results.push(value),
                Err(error) => {
                    results.push(json!({ "error": error.root_message(), "index": index }));
                    errors.push(json!({ "index": index, "error": ErrorDetail::from(&error) }));
                }
            }
        }
        let summary = json!({
            "total": total,
            "succeeded": total - errors.len(),
            "failed": errors.len(),
        });
        tracing::info!(
            "✅ Loop '{}' finished: {}/{} iterations succeeded",
            key,
            total - errors.len(),
            total
        );

        let results = Value::Array(results);
        let errors = Value::Array(errors);
        Ok(NodeOutput::routed(
            json!({ "results": results, "errors": errors, "summary": summary }),
            vec![
                ("results".to_string(), results),
                ("errors".to_string(), errors),
                ("summary".to_string(), summary),
            ],
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        run: &RunScope,
        key: &str,
        config: &ForEachConfig,
        body: &CompiledGraph,
        ctx: &ExecutionContext,
        index: usize,
        item: Value,
        loop_cancel: CancellationToken,
    ) -> Result<Value, NodeError> {
        let child = ctx.child([
            ("item".to_string(), item.clone()),
            ("index".to_string(), json!(index)),
            ("input".to_string(), item),
        ]);
        let iteration_cancel = loop_cancel.child_token();
        let scope = Scope::new(format!("{}[{}]", key, index), iteration_cancel.clone());
        let limit = config.iteration_timeout_ms.map(Duration::from_millis);
        with_deadline(
            limit,
            &iteration_cancel,
            self.run_body(run, body, child, &scope, config.result_source.as_deref()),
            || {
                NodeError::SafetyLimitExceeded(format!(
                    "iteration {} of '{}' exceeded {}ms",
                    index,
                    key,
                    limit.map(|l| l.as_millis()).unwrap_or_default()
                ))
            },
        )
        .await
    }
}
