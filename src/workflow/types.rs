/// Core workflow type definitions
///
/// Defines workflows, nodes, connections and the policy value objects that decorate
/// nodes. These types are serialized/deserialized from JSON for persistence and for
/// the HTTP API, using the camelCase field names the editor produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition containing nodes and their connections
///
/// Node order matters: when several nodes are ready at the same time the walker
/// picks them in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier (e.g., "wf-onboarding")
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Nodes in declaration order
    pub nodes: Vec<NodeDefinition>,
    /// Handle-to-handle wiring between nodes
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// A single node in the workflow graph
///
/// `node_type` selects both the config schema and the capability invoker. The config
/// is kept as a raw JSON object because most values are template strings that can
/// only be typed after resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Unique node identifier within the graph (e.g., "fetch_user")
    pub id: String,
    /// Node type string (e.g., "httpRequest", "forEachLoop")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Optional display name used in diagnostics and error webhooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node configuration: literals or `{{source.path}}` templates
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Declared input ports; the node kind supplies defaults when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_handles: Vec<String>,
    /// Declared output ports; the node kind supplies defaults when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_handles: Vec<String>,
    /// Generic retry policy applied by the resilience wrapper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Best-effort notification fired when the node fails permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_webhook: Option<OnErrorWebhook>,
    /// Per-invocation timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeDefinition {
    /// Name used in logs and notifications
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Retry policy from the node itself, or from `config.retry` where older
    /// definitions stored it
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry.clone().or_else(|| {
            self.config
                .get("retry")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        })
    }

    /// Raw on-error webhook definition, node level first, then `config.onErrorWebhook`
    ///
    /// The config variant may hold templates, so it is returned unresolved.
    pub fn on_error_webhook_raw(&self) -> Option<Value> {
        match &self.on_error_webhook {
            Some(hook) => serde_json::to_value(hook).ok(),
            None => self.config.get("onErrorWebhook").cloned().and_then(|v| match v {
                // The editor stores it as a JSON string when edited in a textarea
                Value::String(s) => serde_json::from_str(&s).ok(),
                Value::Null => None,
                other => Some(other),
            }),
        }
    }
}

fn default_source_handle() -> String {
    "output".to_string()
}

fn default_target_handle() -> String {
    "input".to_string()
}

/// Connection between two node handles
///
/// A target handle may receive from at most one connection; fan-in goes through an
/// aggregating node instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source_node_id: String,
    #[serde(default = "default_source_handle")]
    pub source_handle: String,
    pub target_node_id: String,
    #[serde(default = "default_target_handle")]
    pub target_handle: String,
}

impl Connection {
    /// Shorthand for the default `output` → `input` wiring
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            source_handle: default_source_handle(),
            target_node_id: target.into(),
            target_handle: default_target_handle(),
        }
    }

    /// Wiring from a named source handle (e.g. a branch label or `error`)
    pub fn from_handle(
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source_node_id: source.into(),
            source_handle: source_handle.into(),
            target_node_id: target.into(),
            target_handle: default_target_handle(),
        }
    }
}

fn default_backoff_factor() -> f64 {
    1.0
}

/// Retry policy value object
///
/// Status codes and keywords are filters: when both are empty every invocation
/// error is retried, otherwise only errors matching one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub retry_on_status_codes: Vec<u16>,
    /// Matched case-insensitively as substrings of the error message
    #[serde(default)]
    pub retry_on_error_keywords: Vec<String>,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.delay_ms as f64 * self.backoff_factor.powi(exponent);
        std::time::Duration::from_millis(millis.max(0.0).round() as u64)
    }

    /// Whether an error with this status code and message passes the filters
    pub fn matches(&self, status_code: Option<u16>, message: &str) -> bool {
        if self.retry_on_status_codes.is_empty() && self.retry_on_error_keywords.is_empty() {
            return true;
        }
        if let Some(code) = status_code {
            if self.retry_on_status_codes.contains(&code) {
                return true;
            }
        }
        let lowered = message.to_lowercase();
        self.retry_on_error_keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }
}

/// HTTP method used for the on-error notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

/// On-error webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnErrorWebhook {
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: Map<String, Value>,
    /// Optional body; `{{failed_node_id}}` and friends are available as placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<Value>,
}

/// Whether capability invokers call out or return canned responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Simulate,
    Live,
}

impl RunMode {
    pub fn is_simulation(self) -> bool {
        matches!(self, RunMode::Simulate)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Simulate => write!(f, "simulate"),
            RunMode::Live => write!(f, "live"),
        }
    }
}
