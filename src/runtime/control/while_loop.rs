/// While-loop executor
///
/// Re-runs the body while the condition holds. Loop state lives in locals: every
/// state variable by name, the whole map as `state`, and the iteration counter.
/// The condition is checked before each iteration; a loop whose condition is
/// still true after `maxIterations` runs fails with a safety-limit error.

use crate::runtime::context::ExecutionContext;
use crate::runtime::control::{resolve_mapping, with_deadline};
use crate::runtime::engine::{ExecutionEngine, NodeOutput, RunScope, Scope, WalkFailure};
use crate::runtime::error::NodeError;
use crate::runtime::expression;
use crate::runtime::resilience;
use crate::runtime::template;
use crate::workflow::nodes::{CompiledGraph, WhileConfig};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    ConditionFalse,
    BreakCondition,
}

impl BreakReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakReason::ConditionFalse => "condition_false",
            BreakReason::BreakCondition => "break_condition",
        }
    }
}

fn state_locals(
    state: &Map<String, Value>,
    counter: &str,
    iterations: u64,
) -> Vec<(String, Value)> {
    let mut locals: Vec<(String, Value)> = state
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    locals.push(("state".to_string(), Value::Object(state.clone())));
    locals.push((counter.to_string(), json!(iterations)));
    locals
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_while(
        &self,
        run: &RunScope,
        key: &str,
        config: &WhileConfig,
        body: &CompiledGraph,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
    ) -> Result<NodeOutput, NodeError> {
        let state = resolve_mapping(&config.state_variables, ctx)?;
        let loop_cancel = scope.cancel.child_token();
        let limit = config.loop_timeout_ms.map(Duration::from_millis);

        let (iterations, reason, state) = with_deadline(
            limit,
            &loop_cancel,
            self.iterate_while(run, key, config, body, ctx, &loop_cancel, input, state),
            || {
                NodeError::SafetyLimitExceeded(format!(
                    "whileLoop '{}' exceeded loopTimeoutMs {}",
                    key,
                    limit.map(|l| l.as_millis()).unwrap_or_default()
                ))
            },
        )
        .await?;

        tracing::info!(
            "✅ While loop '{}' stopped after {} iterations ({})",
            key,
            iterations,
            reason.as_str()
        );
        let final_state = Value::Object(state);
        let iterations = json!(iterations);
        let reason = json!(reason.as_str());
        Ok(NodeOutput::routed(
            json!({
                "final_state": final_state,
                "iterations_completed": iterations,
                "break_reason": reason,
            }),
            vec![
                ("final_state".to_string(), final_state),
                ("iterations_completed".to_string(), iterations),
                ("break_reason".to_string(), reason),
            ],
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn iterate_while(
        &self,
        run: &RunScope,
        key: &str,
        config: &WhileConfig,
        body: &CompiledGraph,
        ctx: &ExecutionContext,
        loop_cancel: &CancellationToken,
        input: &Value,
        mut state: Map<String, Value>,
    ) -> Result<(u64, BreakReason, Map<String, Value>), NodeError> {
        let counter = config.iteration_counter.as_str();
        let delay = Duration::from_millis(config.delay_between_iterations_ms);
        let mut iterations: u64 = 0;

        loop {
            let locals = state_locals(&state, counter, iterations);
            let probe = ctx.child(locals.clone());
            if !expression::evaluate(&config.condition, &probe, input)? {
                return Ok((iterations, BreakReason::ConditionFalse, state));
            }
            if iterations >= config.max_iterations {
                return Err(NodeError::SafetyLimitExceeded(format!(
                    "whileLoop '{}' condition still true after maxIterations {}",
                    key, config.max_iterations
                )));
            }
            if iterations > 0 && !resilience::backoff(delay, loop_cancel).await {
                return Err(NodeError::Cancelled);
            }

            let mut child = ctx.child(locals);
            let scope = Scope::new(format!("{}[{}]", key, iterations), loop_cancel.clone());
            self.walk(run, body, &mut child, &scope)
                .await
                .map_err(WalkFailure::into_node_error)?;
            iterations += 1;

            for (name, update) in &config.state_updates {
                let value = template::resolve_value(update, &child)?;
                state.insert(name.clone(), value);
            }
            tracing::debug!("🔁 While loop '{}' iteration {} done", key, iterations);

            if let Some(break_condition) = &config.break_condition {
                let probe = child.with_locals(state_locals(&state, counter, iterations));
                if expression::evaluate(break_condition, &probe, input)? {
                    return Ok((iterations, BreakReason::BreakCondition, state));
                }
            }
        }
    }
}
