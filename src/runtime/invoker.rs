/// Capability invoker contract and registry
///
/// Every action node, built-in or integration, runs through one uniform contract:
/// resolved config plus input in, JSON value or `InvocationError` out. The registry
/// maps node type strings to invokers and routes side-effecting calls to the
/// simulation invoker when a run is in `simulate` mode.

use crate::runtime::capabilities;
use crate::runtime::error::{InvocationError, InvocationErrorKind};
use crate::workflow::types::RunMode;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Everything an invoker gets for one attempt
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    pub node_id: &'a str,
    pub node_type: &'a str,
    /// Config with every template already resolved
    pub config: &'a Map<String, Value>,
    pub input: &'a Value,
    pub mode: RunMode,
    pub cancel: &'a CancellationToken,
}

impl<'a> InvocationRequest<'a> {
    /// Required string field from the resolved config
    pub fn require_str(&self, key: &str) -> Result<&'a str, InvocationError> {
        self.config.get(key).and_then(Value::as_str).ok_or_else(|| {
            InvocationError::validation(format!(
                "{} node '{}' is missing '{}'",
                self.node_type, self.node_id, key
            ))
        })
    }

    pub fn str_or(&self, key: &str, default: &'a str) -> &'a str {
        self.config.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    /// Deserialize the resolved config into a typed struct
    pub fn typed<T: serde::de::DeserializeOwned>(&self) -> Result<T, InvocationError> {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|e| {
            InvocationError::validation(format!(
                "{} node '{}' has invalid config: {}",
                self.node_type, self.node_id, e
            ))
        })
    }
}

/// A capability the engine can call on behalf of a node
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError>;

    /// Pure invokers run the same way in simulate and live mode
    fn side_effecting(&self) -> bool {
        true
    }
}

/// Canned response configured on a node, first of the supported keys
pub fn canned_response(config: &Map<String, Value>) -> Option<Value> {
    ["simulatedResponse", "simulated_config", "simulatedOutput"]
        .iter()
        .find_map(|key| config.get(*key))
        .filter(|value| !value.is_null())
        .map(|value| match value {
            // Editors store canned JSON as text; keep plain strings as they are
            Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.clone()),
            other => other.clone(),
        })
}

fn config_u64(config: &Map<String, Value>, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn simulated_error(raw: &Value) -> InvocationError {
    let message = raw
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| raw.as_str().map(str::to_string))
        .unwrap_or_else(|| "simulated failure".to_string());
    let status_code = raw
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok());
    let kind = raw
        .get("kind")
        .and_then(|kind| serde_json::from_value::<InvocationErrorKind>(kind.clone()).ok());

    match (kind, status_code) {
        (Some(kind), status_code) => InvocationError {
            kind,
            message,
            status_code,
        },
        (None, Some(code)) => InvocationError::from_status(code, message),
        (None, None) => InvocationError::internal(message),
    }
}

/// Apply `simulatedDelayMs`, `simulatedError` and `simulatedStatusCode`
async fn rehearse_failure(config: &Map<String, Value>) -> Result<(), InvocationError> {
    if let Some(delay_ms) = config_u64(config, "simulatedDelayMs") {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    if let Some(raw) = config.get("simulatedError").filter(|v| !v.is_null()) {
        return Err(simulated_error(raw));
    }
    if let Some(code) = config_u64(config, "simulatedStatusCode") {
        if !(200..300).contains(&code) {
            let code = u16::try_from(code).unwrap_or(500);
            return Err(InvocationError::from_status(
                code,
                format!("simulated upstream status {}", code),
            ));
        }
    }
    Ok(())
}

/// Returns canned responses instead of touching the outside world
#[derive(Debug, Default)]
pub struct SimulatedInvoker;

#[async_trait]
impl CapabilityInvoker for SimulatedInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        rehearse_failure(request.config).await?;

        tracing::debug!("🎭 Simulating {} node: {}", request.node_type, request.node_id);
        Ok(canned_response(request.config).unwrap_or_else(|| {
            json!({
                "simulated": true,
                "nodeType": request.node_type,
                "input": request.input,
            })
        }))
    }
}

/// Fallback for node types nobody registered
///
/// Simulated failures still apply in simulate mode.
#[derive(Debug, Default)]
pub struct PassthroughInvoker;

#[async_trait]
impl CapabilityInvoker for PassthroughInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        if request.mode.is_simulation() {
            rehearse_failure(request.config).await?;
        }
        tracing::warn!(
            "⚠️ No invoker registered for node type '{}' (node: {}), passing through",
            request.node_type,
            request.node_id
        );
        Ok(canned_response(request.config).unwrap_or_else(|| {
            Value::String(format!(
                "node type '{}' has no registered capability; output passed through",
                request.node_type
            ))
        }))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

/// Node type → invoker table
#[derive(Clone)]
pub struct InvokerRegistry {
    invokers: HashMap<String, Arc<dyn CapabilityInvoker>>,
    simulated: Arc<dyn CapabilityInvoker>,
    passthrough: Arc<dyn CapabilityInvoker>,
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.invokers.keys().collect();
        types.sort();
        f.debug_struct("InvokerRegistry").field("types", &types).finish()
    }
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvokerRegistry {
    /// Empty registry: everything goes to the passthrough
    pub fn new() -> Self {
        Self {
            invokers: HashMap::new(),
            simulated: Arc::new(SimulatedInvoker),
            passthrough: Arc::new(PassthroughInvoker),
        }
    }

    /// Registry with every built-in capability
    pub fn with_builtins(http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        capabilities::register_builtins(&mut registry, http);
        registry
    }

    /// Register (or replace) the invoker for a node type
    pub fn register(&mut self, node_type: impl Into<String>, invoker: Arc<dyn CapabilityInvoker>) {
        self.invokers.insert(node_type.into(), invoker);
    }

    pub fn with(mut self, node_type: impl Into<String>, invoker: Arc<dyn CapabilityInvoker>) -> Self {
        self.register(node_type, invoker);
        self
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.invokers.contains_key(node_type)
    }

    /// Invoker that should serve `node_type` in `mode`
    pub fn resolve(&self, node_type: &str, mode: RunMode) -> Arc<dyn CapabilityInvoker> {
        match self.invokers.get(node_type) {
            Some(invoker) if mode.is_simulation() && invoker.side_effecting() => {
                Arc::clone(&self.simulated)
            }
            Some(invoker) => Arc::clone(invoker),
            None => Arc::clone(&self.passthrough),
        }
    }
}
