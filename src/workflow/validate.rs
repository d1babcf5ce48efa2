/// Graph validation and compilation
///
/// Checks a workflow graph before anything runs and turns it into a
/// `CompiledGraph`: node kinds parsed, handles resolved, sub-graphs of
/// control-flow nodes compiled recursively. Cycle detection uses a petgraph
/// topological sort over the connections.

use crate::workflow::nodes::{
    canonical_type, BranchConfig, CompiledGraph, CompiledNode, ForEachConfig, GraphSpec, NodeKind,
    ParallelConfig, RecoveryConfig, RecoveryStrategy, SubFlowConfig, WhileConfig,
    BUILTIN_ACTIONS, TRIGGER_TYPES,
};
use crate::workflow::types::{Connection, NodeDefinition, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;

/// Reasons a graph is rejected before execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphValidationError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("connection references unknown node '{node_id}'")]
    DanglingConnection { node_id: String },

    #[error("node '{node_id}' has no {direction} handle '{handle}'")]
    UndeclaredHandle {
        node_id: String,
        handle: String,
        direction: &'static str,
    },

    #[error("input handle '{handle}' of node '{node_id}' receives more than one connection")]
    DuplicateTargetHandle { node_id: String, handle: String },

    #[error("graph contains a cycle through node '{0}'")]
    Cycle(String),

    #[error("node '{node_id}' has an invalid configuration: {reason}")]
    InvalidConfig { node_id: String, reason: String },

    #[error("in sub-graph of node '{node_id}': {error}")]
    Nested {
        node_id: String,
        #[source]
        error: Box<GraphValidationError>,
    },
}

fn invalid(node: &NodeDefinition, reason: impl Into<String>) -> GraphValidationError {
    GraphValidationError::InvalidConfig {
        node_id: node.id.clone(),
        reason: reason.into(),
    }
}

fn nested(node: &NodeDefinition, error: GraphValidationError) -> GraphValidationError {
    GraphValidationError::Nested {
        node_id: node.id.clone(),
        error: Box::new(error),
    }
}

fn typed_config<T: DeserializeOwned>(node: &NodeDefinition) -> Result<T, GraphValidationError> {
    serde_json::from_value(Value::Object(node.config.clone())).map_err(|e| invalid(node, e.to_string()))
}

fn compile_body(node: &NodeDefinition, body: &GraphSpec) -> Result<Arc<CompiledGraph>, GraphValidationError> {
    compile_graph(&body.nodes, &body.connections)
        .map(Arc::new)
        .map_err(|e| nested(node, e))
}

/// Parse a node's kind and typed config
fn compile_kind(node: &NodeDefinition) -> Result<NodeKind, GraphValidationError> {
    let node_type = canonical_type(&node.node_type);
    if TRIGGER_TYPES.contains(&node_type) {
        return Ok(NodeKind::Trigger);
    }

    let kind = match node_type {
        "conditionalBranch" => {
            let config: BranchConfig = typed_config(node)?;
            if config.conditions.is_empty() {
                return Err(invalid(node, "conditionalBranch needs at least one condition"));
            }
            let handles = config.handles();
            let unique: HashSet<&String> = handles.iter().collect();
            if unique.len() != handles.len() {
                return Err(invalid(node, "branch handles must be unique"));
            }
            NodeKind::Branch(config)
        }
        "forEachLoop" => {
            let config: ForEachConfig = typed_config(node)?;
            let body = compile_body(node, &config.body)?;
            NodeKind::ForEach { config, body }
        }
        "whileLoop" => {
            let config: WhileConfig = typed_config(node)?;
            if config.condition.trim().is_empty() {
                return Err(invalid(node, "whileLoop needs a condition"));
            }
            let body = compile_body(node, &config.body)?;
            NodeKind::While { config, body }
        }
        "parallelExecution" => {
            let config: ParallelConfig = typed_config(node)?;
            if config.branches.is_empty() {
                return Err(invalid(node, "parallelExecution needs at least one branch"));
            }
            let mut seen = HashSet::new();
            let mut branches = Vec::with_capacity(config.branches.len());
            for branch in &config.branches {
                if !seen.insert(branch.id.as_str()) {
                    return Err(invalid(node, format!("duplicate branch id '{}'", branch.id)));
                }
                branches.push(compile_body(node, &branch.body)?);
            }
            NodeKind::Parallel { config, branches }
        }
        "executeFlowGroup" => {
            let config: SubFlowConfig = typed_config(node)?;
            let body = compile_body(node, &config.body)?;
            NodeKind::SubFlow { config, body }
        }
        "errorRecovery" => {
            let config: RecoveryConfig = typed_config(node)?;
            match config.strategy {
                RecoveryStrategy::Fallback if config.fallback_config.is_none() => {
                    return Err(invalid(node, "fallback strategy needs fallbackConfig"));
                }
                RecoveryStrategy::DeadLetterQueue if config.dlq_config.is_none() => {
                    return Err(invalid(node, "dead-letter-queue strategy needs dlqConfig"));
                }
                _ => {}
            }
            let protected = compile_body(node, &config.protected.body)?;
            let fallback = match &config.fallback_config {
                Some(fallback) if !fallback.body.nodes.is_empty() => {
                    Some(compile_body(node, &fallback.body)?)
                }
                _ => None,
            };
            NodeKind::Recovery {
                config,
                protected,
                fallback,
            }
        }
        other if BUILTIN_ACTIONS.contains(&other) => NodeKind::Action,
        other => NodeKind::Unknown(other.to_string()),
    };
    Ok(kind)
}

fn compile_node(node: &NodeDefinition) -> Result<CompiledNode, GraphValidationError> {
    let kind = compile_kind(node)?;
    let inputs = if node.input_handles.is_empty() {
        kind.default_inputs()
    } else {
        node.input_handles.clone()
    };
    let outputs = if node.output_handles.is_empty() {
        kind.default_outputs()
    } else {
        node.output_handles.clone()
    };
    Ok(CompiledNode {
        def: node.clone(),
        kind,
        inputs,
        outputs,
    })
}

/// Validate and compile a node list with its connections
pub fn compile_graph(
    nodes: &[NodeDefinition],
    connections: &[Connection],
) -> Result<CompiledGraph, GraphValidationError> {
    let mut index = HashMap::with_capacity(nodes.len());
    let mut compiled = Vec::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            return Err(GraphValidationError::EmptyNodeId);
        }
        if index.insert(node.id.clone(), position).is_some() {
            return Err(GraphValidationError::DuplicateNodeId(node.id.clone()));
        }
        compiled.push(compile_node(node)?);
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let graph_indices: Vec<NodeIndex> = (0..compiled.len()).map(|p| graph.add_node(p)).collect();
    let mut incoming: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut wired_targets = HashSet::new();

    for (position, connection) in connections.iter().enumerate() {
        let source = *index.get(&connection.source_node_id).ok_or_else(|| {
            GraphValidationError::DanglingConnection {
                node_id: connection.source_node_id.clone(),
            }
        })?;
        let target = *index.get(&connection.target_node_id).ok_or_else(|| {
            GraphValidationError::DanglingConnection {
                node_id: connection.target_node_id.clone(),
            }
        })?;

        if !compiled[source].has_output(&connection.source_handle) {
            return Err(GraphValidationError::UndeclaredHandle {
                node_id: connection.source_node_id.clone(),
                handle: connection.source_handle.clone(),
                direction: "output",
            });
        }
        if !compiled[target].has_input(&connection.target_handle) {
            return Err(GraphValidationError::UndeclaredHandle {
                node_id: connection.target_node_id.clone(),
                handle: connection.target_handle.clone(),
                direction: "input",
            });
        }
        if !wired_targets.insert((target, connection.target_handle.clone())) {
            return Err(GraphValidationError::DuplicateTargetHandle {
                node_id: connection.target_node_id.clone(),
                handle: connection.target_handle.clone(),
            });
        }

        graph.add_edge(graph_indices[source], graph_indices[target], ());
        incoming.entry(target).or_default().push(position);
    }

    if let Err(cycle) = toposort(&graph, None) {
        let node_id = compiled[graph[cycle.node_id()]].def.id.clone();
        return Err(GraphValidationError::Cycle(node_id));
    }

    let triggers: Vec<usize> = compiled
        .iter()
        .enumerate()
        .filter(|(_, node)| node.kind.is_trigger())
        .map(|(position, _)| position)
        .collect();
    let roots = if triggers.is_empty() {
        (0..compiled.len())
            .filter(|position| !incoming.contains_key(position))
            .collect()
    } else {
        triggers
    };

    Ok(CompiledGraph {
        nodes: compiled,
        connections: connections.to_vec(),
        index,
        incoming,
        roots,
    })
}

/// Validate and compile a whole workflow
pub fn compile(workflow: &WorkflowDefinition) -> Result<CompiledGraph, GraphValidationError> {
    compile_graph(&workflow.nodes, &workflow.connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(value: Value) -> WorkflowDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn roots_are_triggers_when_present() {
        let wf = workflow(json!({
            "nodes": [
                { "id": "orphan", "type": "logMessage" },
                { "id": "start", "type": "webhookTrigger" },
                { "id": "log", "type": "logMessage" }
            ],
            "connections": [{ "sourceNodeId": "start", "targetNodeId": "log" }]
        }));
        let graph = compile(&wf).unwrap();
        assert_eq!(graph.roots, vec![1]);
    }

    #[test]
    fn roots_without_triggers_are_nodes_without_incoming() {
        let wf = workflow(json!({
            "nodes": [
                { "id": "a", "type": "logMessage" },
                { "id": "b", "type": "logMessage" },
                { "id": "c", "type": "logMessage" }
            ],
            "connections": [{ "sourceNodeId": "a", "targetNodeId": "b" }]
        }));
        assert_eq!(compile(&wf).unwrap().roots, vec![0, 2]);
    }

    #[test]
    fn rejects_duplicates_dangling_and_cycles() {
        let dup = workflow(json!({
            "nodes": [{ "id": "a", "type": "delay" }, { "id": "a", "type": "delay" }]
        }));
        assert_eq!(
            compile(&dup).unwrap_err(),
            GraphValidationError::DuplicateNodeId("a".into())
        );

        let dangling = workflow(json!({
            "nodes": [{ "id": "a", "type": "delay" }],
            "connections": [{ "sourceNodeId": "a", "targetNodeId": "ghost" }]
        }));
        assert!(matches!(
            compile(&dangling).unwrap_err(),
            GraphValidationError::DanglingConnection { .. }
        ));

        let cycle = workflow(json!({
            "nodes": [{ "id": "a", "type": "delay" }, { "id": "b", "type": "delay" }],
            "connections": [
                { "sourceNodeId": "a", "targetNodeId": "b" },
                { "sourceNodeId": "b", "targetNodeId": "a" }
            ]
        }));
        assert!(matches!(compile(&cycle).unwrap_err(), GraphValidationError::Cycle(_)));
    }

    #[test]
    fn rejects_undeclared_handles_and_double_wired_inputs() {
        let undeclared = workflow(json!({
            "nodes": [{ "id": "a", "type": "delay" }, { "id": "b", "type": "delay" }],
            "connections": [{ "sourceNodeId": "a", "sourceHandle": "results", "targetNodeId": "b" }]
        }));
        assert!(matches!(
            compile(&undeclared).unwrap_err(),
            GraphValidationError::UndeclaredHandle { direction: "output", .. }
        ));

        let double = workflow(json!({
            "nodes": [
                { "id": "a", "type": "delay" },
                { "id": "b", "type": "delay" },
                { "id": "c", "type": "delay" }
            ],
            "connections": [
                { "sourceNodeId": "a", "targetNodeId": "c" },
                { "sourceNodeId": "b", "targetNodeId": "c" }
            ]
        }));
        assert!(matches!(
            compile(&double).unwrap_err(),
            GraphValidationError::DuplicateTargetHandle { .. }
        ));
    }

    #[test]
    fn nested_sub_graphs_are_validated() {
        let wf = workflow(json!({
            "nodes": [{
                "id": "loop",
                "type": "forEach",
                "config": {
                    "nodes": [{ "id": "x", "type": "delay" }],
                    "connections": [{ "sourceNodeId": "x", "targetNodeId": "y" }]
                }
            }]
        }));
        let err = compile(&wf).unwrap_err();
        assert!(matches!(err, GraphValidationError::Nested { ref node_id, .. } if node_id == "loop"));
    }

    #[test]
    fn malformed_control_config_is_rejected() {
        let wf = workflow(json!({
            "nodes": [{ "id": "p", "type": "parallelExecution", "config": { "branches": [] } }]
        }));
        assert!(matches!(
            compile(&wf).unwrap_err(),
            GraphValidationError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn unknown_types_compile_with_action_handles() {
        let wf = workflow(json!({ "nodes": [{ "id": "s", "type": "slackPostMessage" }] }));
        let graph = compile(&wf).unwrap();
        let node = graph.node("s").unwrap();
        assert!(matches!(node.kind, NodeKind::Unknown(ref t) if t == "slackPostMessage"));
        assert_eq!(node.outputs, vec!["output", "error"]);
    }
}
