/// Conditional branch executor
///
/// Evaluates the ordered condition list against the node input and publishes the
/// input unchanged on exactly one handle.

use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::NodeOutput;
use crate::runtime::error::NodeError;
use crate::runtime::expression;
use crate::workflow::nodes::{BranchConfig, EvaluationMode};
use serde_json::Value;

/// Pick the branch handle for `input`
///
/// Sequential mode stops at the first true condition, parallel mode evaluates
/// every condition and still picks the first true one in declaration order, and
/// `all` requires every condition to hold and selects the first handle. Without
/// a match the default branch is taken. Unresolved placeholders always fail the
/// node. Malformed conditions count as false unless `strictMode` is set.
pub fn evaluate_branch(
    key: &str,
    config: &BranchConfig,
    ctx: &ExecutionContext,
    input: &Value,
) -> Result<NodeOutput, NodeError> {
    let mut outcomes = Vec::with_capacity(config.conditions.len());
    for condition in &config.conditions {
        let holds = match expression::evaluate(&condition.expression, ctx, input) {
            Ok(holds) => holds,
            Err(e) if config.strict_mode || e.is_unresolved() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Branch '{}' condition '{}' treated as false: {}",
                    key,
                    condition.expression,
                    e
                );
                false
            }
        };
        outcomes.push(holds);
        if holds && config.evaluation_mode == EvaluationMode::Sequential {
            break;
        }
    }

    let matched = match config.evaluation_mode {
        EvaluationMode::Sequential | EvaluationMode::Parallel => {
            outcomes.iter().position(|holds| *holds)
        }
        EvaluationMode::All => {
            let all_hold = !outcomes.is_empty() && outcomes.iter().all(|holds| *holds);
            all_hold.then_some(0)
        }
    };
    let handle = matched
        .map(|index| config.conditions[index].handle(index))
        .unwrap_or_else(|| config.default_branch.clone());

    tracing::debug!("🔀 Branch '{}' took '{}'", key, handle);
    Ok(NodeOutput::on(handle, input.clone()))
}
