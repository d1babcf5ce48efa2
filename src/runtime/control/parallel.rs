/// Parallel fan-out executor
///
/// Starts every branch with its mapped inputs under a concurrency limit, waits
/// for them (bounded by the node timeout) and aggregates the branch results.

use crate::runtime::context::ExecutionContext;
use crate::runtime::control::{resolve_mapping, with_deadline};
use crate::runtime::engine::{ExecutionEngine, NodeOutput, RunScope, Scope};
use crate::runtime::error::{ErrorDetail, NodeError};
use crate::workflow::nodes::{
    CompiledGraph, FailureHandling, ParallelBranch, ParallelConfig, ResultAggregation,
};
use futures::{stream, StreamExt};
use serde_json::{json, Map, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// How one branch ended
#[derive(Debug, Clone)]
struct BranchOutcome {
    result: Result<Value, NodeError>,
    /// Completion order, 0 for the first branch to finish
    finished: usize,
    elapsed: Duration,
}

/// Aggregate successful branch values
///
/// `successes` holds `(branch index, finish order, value)` in declaration order.
fn aggregate(
    aggregation: ResultAggregation,
    branches: &[ParallelBranch],
    successes: &[(usize, usize, &Value)],
    failures: &Map<String, Value>,
) -> Value {
    match aggregation {
        ResultAggregation::Collect => {
            let mut collected = Map::new();
            for (index, _, value) in successes {
                collected.insert(branches[*index].id.clone(), (*value).clone());
            }
            for (id, error) in failures {
                collected.insert(id.clone(), error.clone());
            }
            Value::Object(collected)
        }
        ResultAggregation::Merge => {
            let mut merged = Map::new();
            for (index, _, value) in successes {
                match value {
                    Value::Object(fields) => {
                        merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    other => {
                        merged.insert(branches[*index].id.clone(), (*other).clone());
                    }
                }
            }
            Value::Object(merged)
        }
        ResultAggregation::First => successes
            .first()
            .map(|(_, _, value)| (*value).clone())
            .unwrap_or(Value::Null),
        ResultAggregation::Fastest => successes
            .iter()
            .min_by_key(|(_, finished, _)| *finished)
            .map(|(_, _, value)| (*value).clone())
            .unwrap_or(Value::Null),
        ResultAggregation::Majority => {
            // Ties go to the value seen first in declaration order
            let mut tally: Vec<(&Value, usize)> = Vec::new();
            for (_, _, value) in successes {
                match tally.iter_mut().find(|(seen, _)| seen == value) {
                    Some((_, count)) => *count += 1,
                    None => tally.push((value, 1)),
                }
            }
            let mut best: Option<(&Value, usize)> = None;
            for (value, count) in tally {
                if best.map_or(true, |(_, top)| count > top) {
                    best = Some((value, count));
                }
            }
            best.map(|(value, _)| value.clone()).unwrap_or(Value::Null)
        }
    }
}

impl ExecutionEngine {
    pub(crate) async fn run_parallel(
        &self,
        run: &RunScope,
        key: &str,
        config: &ParallelConfig,
        branches: &[Arc<CompiledGraph>],
        ctx: &ExecutionContext,
        scope: &Scope,
    ) -> Result<NodeOutput, NodeError> {
        let mut prepared = Vec::with_capacity(branches.len());
        for (index, (branch, graph)) in config.branches.iter().zip(branches).enumerate() {
            let mapped = resolve_mapping(&branch.input_mapping, ctx)?;
            prepared.push((index, branch, Arc::clone(graph), mapped));
        }
        let total = prepared.len();
        let limit = match config.concurrency_limit {
            0 if total > self.config.max_parallelism => {
                tracing::warn!(
                    "⚠️ Parallel '{}' has unlimited concurrency, capping {} branches at KAIRO_MAX_PARALLELISM {}",
                    key,
                    total,
                    self.config.max_parallelism
                );
                self.config.max_parallelism
            }
            0 => total,
            n => n,
        }
        .max(1);
        tracing::info!(
            "🔀 Parallel '{}' starting {} branches (limit {})",
            key,
            total,
            limit
        );

        let fan_cancel = scope.cancel.child_token();
        let started = Instant::now();
        let spawn_cancel = fan_cancel.clone();
        let collect = async {
            let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; total];
            let mut finished = 0;
            let mut fail_fast: Option<NodeError> = None;

            let mut running = stream::iter(prepared)
                .map(move |(index, branch, graph, mapped)| {
                    let cancel = spawn_cancel.clone();
                    async move {
                        let child = ctx.child(mapped);
                        let branch_scope = Scope::new(format!("{}[{}]", key, branch.id), cancel);
                        let branch_started = Instant::now();
                        let result = self
                            .run_body(run, &graph, child, &branch_scope, branch.output_source.as_deref())
                            .await;
                        (index, result, branch_started.elapsed())
                    }
                })
                .buffer_unordered(limit)
                .boxed();

            while let Some((index, result, elapsed)) = running.next().await {
                match &result {
                    Ok(_) if config.result_aggregation == ResultAggregation::Fastest => {
                        fan_cancel.cancel();
                    }
                    Err(error)
                        if config.failure_handling == FailureHandling::FailFast
                            && fail_fast.is_none()
                            && !matches!(error, NodeError::Cancelled) =>
                    {
                        tracing::error!(
                            "❌ Parallel '{}' branch '{}' failed, cancelling siblings",
                            key,
                            config.branches[index].id
                        );
                        fail_fast = Some(error.clone());
                        fan_cancel.cancel();
                    }
                    _ => {}
                }
                outcomes[index] = Some(BranchOutcome {
                    result,
                    finished,
                    elapsed,
                });
                finished += 1;
            }
            match fail_fast {
                Some(error) => Err(error),
                None => Ok(outcomes),
            }
        };

        let limit_ms = config.timeout_ms;
        let outcomes = with_deadline(
            Some(Duration::from_millis(limit_ms)),
            &fan_cancel,
            collect,
            || {
                NodeError::SafetyLimitExceeded(format!(
                    "parallelExecution '{}' exceeded timeoutMs {}",
                    key, limit_ms
                ))
            },
        )
        .await?;
        if scope.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let mut successes = Vec::new();
        let mut failures = Map::new();
        let mut errors = Vec::new();
        let mut cancelled = 0;
        let mut first_error = None;
        for (index, outcome) in outcomes.iter().enumerate() {
            let Some(outcome) = outcome else { continue };
            let id = &config.branches[index].id;
            match &outcome.result {
                Ok(value) => successes.push((index, outcome.finished, value)),
                // Siblings stopped once the fastest branch won
                Err(NodeError::Cancelled) => cancelled += 1,
                Err(error) => {
                    first_error.get_or_insert_with(|| error.clone());
                    if config.failure_handling != FailureHandling::Ignore {
                        failures.insert(id.clone(), json!({ "error": error.root_message() }));
                        errors.push(json!({ "branchId": id, "error": ErrorDetail::from(error) }));
                    }
                }
            }
            tracing::debug!(
                "Parallel '{}' branch '{}' settled in {:?}",
                key,
                id,
                outcome.elapsed
            );
        }

        if successes.is_empty() && total > 0 {
            return Err(first_error.unwrap_or(NodeError::Cancelled));
        }

        let failed = total - successes.len() - cancelled;
        let results = aggregate(config.result_aggregation, &config.branches, &successes, &failures);
        let summary = json!({
            "total": total,
            "succeeded": successes.len(),
            "failed": failed,
            "cancelled": cancelled,
            "durationMs": started.elapsed().as_millis() as u64,
        });
        tracing::info!(
            "✅ Parallel '{}' finished: {}/{} branches succeeded in {:?}",
            key,
            successes.len(),
            total,
            started.elapsed()
        );

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
}
