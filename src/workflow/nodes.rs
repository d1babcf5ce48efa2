/// Node catalog
///
/// Maps node type strings to a closed set of node kinds, supplies default handles,
/// and holds the typed configuration of the control-flow and recovery nodes. Those
/// configs are parsed once when the graph is compiled, together with their embedded
/// sub-graphs. Action nodes keep their raw config; it is typed by the invoker after
/// template resolution.

use crate::workflow::types::{Connection, NodeDefinition, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// Built-in action node types served by the invoker registry
pub const BUILTIN_ACTIONS: &[&str] = &[
    "httpRequest",
    "aiTask",
    "databaseQuery",
    "sendEmail",
    "logMessage",
    "parseJson",
    "delay",
    "toUpperCase",
    "toLowerCase",
    "concatenateStrings",
    "stringSplit",
    "formatDate",
];

/// Node types that start a run
pub const TRIGGER_TYPES: &[&str] = &["trigger", "webhookTrigger", "manualTrigger", "schedule"];

/// Canonical name for aliased node types
pub fn canonical_type(node_type: &str) -> &str {
    match node_type {
        "forEach" => "forEachLoop",
        "parallel" => "parallelExecution",
        "subFlow" => "executeFlowGroup",
        other => other,
    }
}

/// Lenient number parsing: editors store numeric fields as numbers or strings
pub(crate) mod lenient {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    fn to_u64(raw: &Value) -> Option<u64> {
        match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u64>,
    {
        let raw = Value::deserialize(deserializer)?;
        let n = to_u64(&raw)
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative number, got {}", raw)))?;
        T::try_from(n).map_err(|_| D::Error::custom(format!("number {} is out of range", n)))
    }

    pub fn optional_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u64>,
    {
        let raw = Value::deserialize(deserializer)?;
        if raw.is_null() {
            return Ok(None);
        }
        let n = to_u64(&raw)
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative number, got {}", raw)))?;
        T::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("number {} is out of range", n)))
    }

    pub fn float<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match &raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| D::Error::custom(format!("expected a number, got {}", raw)))
    }
}

/// Embedded sub-graph definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

// ---------------------------------------------------------------------------
// Conditional branch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCondition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(alias = "condition")]
    pub expression: String,
}

impl BranchCondition {
    /// Output handle this condition routes to (`index` is 0-based)
    pub fn handle(&self, index: usize) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.label.clone().filter(|label| !label.is_empty()))
            .unwrap_or_else(|| format!("condition{}", index + 1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    #[default]
    Sequential,
    Parallel,
    All,
}

fn default_branch() -> String {
    "else".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    pub conditions: Vec<BranchCondition>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub evaluation_mode: EvaluationMode,
    /// Expression errors fail the node instead of counting as false
    #[serde(default)]
    pub strict_mode: bool,
}

impl BranchConfig {
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self
            .conditions
            .iter()
            .enumerate()
            .map(|(index, condition)| condition.handle(index))
            .collect();
        handles.push(self.default_branch.clone());
        handles
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

fn default_max_concurrency() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachConfig {
    /// Template or literal producing the array; defaults to the node input
    #[serde(default)]
    pub items: Option<Value>,
    #[serde(flatten)]
    pub body: GraphSpec,
    /// Template evaluated in each iteration; defaults to the last node output
    #[serde(default)]
    pub result_source: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub parallel_execution: bool,
    #[serde(default = "default_max_concurrency", deserialize_with = "lenient::number")]
    pub max_concurrency: usize,
    #[serde(default, deserialize_with = "lenient::optional_number")]
    pub iteration_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub delay_between_iterations_ms: u64,
    #[serde(default)]
    pub skip_empty_items: bool,
}

fn default_max_iterations() -> u64 {
    100
}

fn default_iteration_counter() -> String {
    "iteration_count".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileConfig {
    pub condition: String,
    #[serde(flatten)]
    pub body: GraphSpec,
    #[serde(default = "default_max_iterations", deserialize_with = "lenient::number")]
    pub max_iterations: u64,
    #[serde(default, deserialize_with = "lenient::optional_number")]
    pub loop_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub delay_between_iterations_ms: u64,
    /// Initial loop state
    #[serde(default)]
    pub state_variables: Map<String, Value>,
    /// Templates evaluated after each iteration; results replace state keys
    #[serde(default)]
    pub state_updates: Map<String, Value>,
    #[serde(default)]
    pub break_condition: Option<String>,
    #[serde(default = "default_iteration_counter")]
    pub iteration_counter: String,
}

// ---------------------------------------------------------------------------
// Parallel fan-out and sub-flows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAggregation {
    #[default]
    Collect,
    Merge,
    First,
    Fastest,
    Majority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureHandling {
    #[default]
    Continue,
    FailFast,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelBranch {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub body: GraphSpec,
    /// Templates resolved in the parent context, exposed as branch locals
    #[serde(default)]
    pub input_mapping: Map<String, Value>,
    #[serde(default)]
    pub output_source: Option<String>,
}

fn default_parallel_timeout() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    pub branches: Vec<ParallelBranch>,
    /// 0 means no per-node limit; the engine's `max_parallelism` still applies
    #[serde(default, deserialize_with = "lenient::number")]
    pub concurrency_limit: usize,
    #[serde(default)]
    pub result_aggregation: ResultAggregation,
    #[serde(default)]
    pub failure_handling: FailureHandling,
    #[serde(default = "default_parallel_timeout", deserialize_with = "lenient::number")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubFlowConfig {
    #[serde(flatten)]
    pub body: GraphSpec,
    #[serde(default)]
    pub input_mapping: Map<String, Value>,
    #[serde(default)]
    pub output_mapping: Option<Map<String, Value>>,
    #[serde(default)]
    pub output_source: Option<String>,
}

// ---------------------------------------------------------------------------
// Error recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    CircuitBreaker,
    DeadLetterQueue,
    Hybrid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedGraph {
    #[serde(flatten)]
    pub body: GraphSpec,
    #[serde(default)]
    pub output_source: Option<String>,
}

fn default_recovery_attempts() -> u32 {
    3
}

fn default_recovery_backoff() -> u64 {
    1000
}

fn default_recovery_factor() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRetryConfig {
    #[serde(default = "default_recovery_attempts", deserialize_with = "lenient::number")]
    pub max_attempts: u32,
    #[serde(default = "default_recovery_backoff", deserialize_with = "lenient::number")]
    pub backoff_ms: u64,
    #[serde(default = "default_recovery_factor", deserialize_with = "lenient::float")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub retry_on_status_codes: Vec<u16>,
    #[serde(default)]
    pub retry_on_error_keywords: Vec<String>,
}

impl Default for RecoveryRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_recovery_attempts(),
            backoff_ms: default_recovery_backoff(),
            backoff_factor: default_recovery_factor(),
            retry_on_status_codes: Vec::new(),
            retry_on_error_keywords: Vec::new(),
        }
    }
}

impl From<&RecoveryRetryConfig> for RetryPolicy {
    fn from(config: &RecoveryRetryConfig) -> Self {
        RetryPolicy {
            attempts: config.max_attempts.max(1),
            delay_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            retry_on_status_codes: config.retry_on_status_codes.clone(),
            retry_on_error_keywords: config.retry_on_error_keywords.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    #[serde(flatten)]
    pub body: GraphSpec,
    #[serde(default)]
    pub output_source: Option<String>,
    /// Static value used when no fallback nodes are configured
    #[serde(default)]
    pub fallback_data: Option<Value>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    30_000
}

fn default_half_open_calls() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold", deserialize_with = "lenient::number")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout", deserialize_with = "lenient::number")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_calls", deserialize_with = "lenient::number")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout(),
            half_open_max_calls: default_half_open_calls(),
        }
    }
}

fn default_dlq_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqConfig {
    pub dlq_endpoint: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default = "default_dlq_retries", deserialize_with = "lenient::number")]
    pub dlq_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    pub strategy: RecoveryStrategy,
    #[serde(default)]
    pub protected: ProtectedGraph,
    #[serde(default)]
    pub retry_config: Option<RecoveryRetryConfig>,
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,
    #[serde(default)]
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub dlq_config: Option<DlqConfig>,
}

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// Node kind resolved at compile time
#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger,
    /// Built-in action served by the invoker registry
    Action,
    /// Type outside the catalog; served by a registered integration or the passthrough
    Unknown(String),
    Branch(BranchConfig),
    ForEach {
        config: ForEachConfig,
        body: Arc<CompiledGraph>,
    },
    While {
        config: WhileConfig,
        body: Arc<CompiledGraph>,
    },
    Parallel {
        config: ParallelConfig,
        branches: Vec<Arc<CompiledGraph>>,
    },
    SubFlow {
        config: SubFlowConfig,
        body: Arc<CompiledGraph>,
    },
    Recovery {
        config: RecoveryConfig,
        protected: Arc<CompiledGraph>,
        fallback: Option<Arc<CompiledGraph>>,
    },
}

impl NodeKind {
    pub fn is_trigger(&self) -> bool {
        matches!(self, NodeKind::Trigger)
    }

    /// Default input handles when the definition declares none
    pub fn default_inputs(&self) -> Vec<String> {
        match self {
            NodeKind::Trigger => Vec::new(),
            _ => vec!["input".to_string()],
        }
    }

    /// Default output handles when the definition declares none
    pub fn default_outputs(&self) -> Vec<String> {
        let handles: Vec<String> = match self {
            NodeKind::Trigger => return vec!["output".to_string()],
            NodeKind::Action | NodeKind::Unknown(_) | NodeKind::SubFlow { .. } => {
                vec!["output".to_string()]
            }
            NodeKind::Branch(config) => config.handles(),
            NodeKind::ForEach { .. } | NodeKind::Parallel { .. } => {
                vec!["results".into(), "errors".into(), "summary".into()]
            }
            NodeKind::While { .. } => vec![
                "final_state".into(),
                "iterations_completed".into(),
                "break_reason".into(),
            ],
            NodeKind::Recovery { .. } => vec![
                "success".into(),
                "fallback".into(),
                "circuit_open".into(),
                "dlq_sent".into(),
            ],
        };
        let mut handles = handles;
        handles.push("error".to_string());
        handles
    }
}

/// A node with its kind and effective handles
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub def: NodeDefinition,
    pub kind: NodeKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl CompiledNode {
    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn has_output(&self, handle: &str) -> bool {
        self.outputs.iter().any(|h| h == handle)
    }

    pub fn has_input(&self, handle: &str) -> bool {
        self.inputs.iter().any(|h| h == handle)
    }
}

/// Validated graph ready to be walked
#[derive(Debug, Clone, Default)]
pub struct CompiledGraph {
    /// Nodes in declaration order
    pub nodes: Vec<CompiledNode>,
    pub connections: Vec<Connection>,
    /// Node id → position in `nodes`
    pub index: HashMap<String, usize>,
    /// Node position → positions in `connections` targeting it
    pub incoming: HashMap<usize, Vec<usize>>,
    /// Positions of the nodes the walk starts from
    pub roots: Vec<usize>,
}

impl CompiledGraph {
    pub fn node(&self, node_id: &str) -> Option<&CompiledNode> {
        self.index.get(node_id).map(|position| &self.nodes[*position])
    }

    pub fn incoming(&self, position: usize) -> impl Iterator<Item = &Connection> {
        self.incoming
            .get(&position)
            .into_iter()
            .flatten()
            .map(|c| &self.connections[*c])
    }

    /// Whether the node has a connection leaving its `error` handle
    pub fn error_handle_connected(&self, node_id: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c.source_node_id == node_id && c.source_handle == "error")
    }

    pub fn is_root(&self, position: usize) -> bool {
        self.roots.contains(&position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn branch_handles_prefer_id_then_label_then_position() {
        let config: BranchConfig = serde_json::from_value(json!({
            "conditions": [
                { "id": "big", "expression": "> 10" },
                { "label": "medium", "expression": "> 5" },
                { "expression": "> 0" }
            ]
        }))
        .unwrap();
        assert_eq!(config.handles(), vec!["big", "medium", "condition3", "else"]);
        assert_eq!(config.evaluation_mode, EvaluationMode::Sequential);
    }

    #[test]
    fn loop_numbers_accept_strings() {
        let config: WhileConfig = serde_json::from_value(json!({
            "condition": "true",
            "maxIterations": "5",
            "nodes": []
        }))
        .unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.iteration_counter, "iteration_count");
    }

    #[test]
    fn recovery_defaults() {
        let config: RecoveryConfig = serde_json::from_value(json!({
            "strategy": "circuit-breaker",
            "circuitBreakerConfig": {}
        }))
        .unwrap();
        let breaker = config.circuit_breaker_config.unwrap();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.recovery_timeout_ms, 30_000);
        assert_eq!(breaker.half_open_max_calls, 3);

        let retry = RetryPolicy::from(&RecoveryRetryConfig::default());
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.delay_after(2).as_millis(), 2000);
    }

    #[test]
    fn parallel_enums_use_editor_spelling() {
        let config: ParallelConfig = serde_json::from_value(json!({
            "branches": [],
            "failureHandling": "fail-fast",
            "resultAggregation": "fastest"
        }))
        .unwrap();
        assert_eq!(config.failure_handling, FailureHandling::FailFast);
        assert_eq!(config.result_aggregation, ResultAggregation::Fastest);
        assert_eq!(config.timeout_ms, 60_000);
        assert_eq!(config.concurrency_limit, 0);
    }
}
