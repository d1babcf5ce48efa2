/// Sub-flow executor
///
/// Runs an embedded workflow in an isolated context that sees only the mapped
/// inputs, env and credentials. Mapped inputs are exposed by name and together as
/// `input`.

use crate::runtime::context::ExecutionContext;
use crate::runtime::control::{body_result, resolve_mapping};
use crate::runtime::engine::{ExecutionEngine, NodeOutput, RunScope, Scope, WalkFailure};
use crate::runtime::error::NodeError;
use crate::workflow::nodes::{CompiledGraph, SubFlowConfig};
use serde_json::Value;

impl ExecutionEngine {
    pub(crate) async fn run_sub_flow(
        &self,
        run: &RunScope,
        key: &str,
        config: &SubFlowConfig,
        body: &CompiledGraph,
        ctx: &ExecutionContext,
        scope: &Scope,
    ) -> Result<NodeOutput, NodeError> {
        let mapped = resolve_mapping(&config.input_mapping, ctx)?;
        // An explicit `input` mapping wins over the combined object
        let mut locals = vec![("input".to_string(), Value::Object(mapped.clone()))];
        locals.extend(mapped);

        let mut child = ctx.isolated(locals);
        let sub_scope = scope.nested(key);
        tracing::info!("📦 Sub-flow '{}' starting ({} nodes)", key, body.nodes.len());
        self.walk(run, body, &mut child, &sub_scope)
            .await
            .map_err(WalkFailure::into_node_error)?;

        let value = match &config.output_mapping {
            Some(mapping) => Value::Object(resolve_mapping(mapping, &child)?),
            None => body_result(&child, config.output_source.as_deref())?,
        };
        Ok(NodeOutput::all(value))
    }
}
