/// Node-level error types
///
/// Every failure the walker can record on a node is a `NodeError`. Only
/// `InvocationError`s are candidates for retry; everything else is fatal for the
/// node on first occurrence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A placeholder or config value that could not be turned into a typed value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigResolutionError {
    #[error("malformed template '{template}': {reason}")]
    Malformed { template: String, reason: String },

    #[error("unresolved placeholder '{placeholder}': no node output or variable named '{source_name}'")]
    UnknownSource {
        placeholder: String,
        source_name: String,
    },

    #[error("unresolved placeholder '{placeholder}': path segment '{segment}' does not exist")]
    MissingPath { placeholder: String, segment: String },

    #[error("environment value '{0}' is not set")]
    MissingEnv(String),

    #[error("credential '{0}' is not available")]
    MissingCredential(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigResolutionError {
    /// A lookup that found nothing, as opposed to text that could not be parsed
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ConfigResolutionError::UnknownSource { .. }
                | ConfigResolutionError::MissingPath { .. }
                | ConfigResolutionError::MissingEnv(_)
                | ConfigResolutionError::MissingCredential(_)
        )
    }
}

/// Classification of capability failures, used by retry filters and the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationErrorKind {
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "validation")]
    Validation,
    #[serde(rename = "upstream_4xx")]
    Upstream4xx,
    #[serde(rename = "upstream_5xx")]
    Upstream5xx,
    #[serde(rename = "internal")]
    Internal,
}

impl InvocationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationErrorKind::Timeout => "timeout",
            InvocationErrorKind::Validation => "validation",
            InvocationErrorKind::Upstream4xx => "upstream_4xx",
            InvocationErrorKind::Upstream5xx => "upstream_5xx",
            InvocationErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a capability invoker
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl InvocationError {
    pub fn new(kind: InvocationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Internal, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            InvocationErrorKind::Timeout,
            format!("invocation timeout after {}ms", after.as_millis()),
        )
    }

    /// Map an upstream HTTP status to the 4xx/5xx kinds
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let kind = if (400..500).contains(&status_code) {
            InvocationErrorKind::Upstream4xx
        } else if status_code >= 500 {
            InvocationErrorKind::Upstream5xx
        } else {
            InvocationErrorKind::Internal
        };
        Self {
            kind,
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

/// Everything that can make a node fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error(transparent)]
    ConfigResolution(#[from] ConfigResolutionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("safety limit exceeded: {0}")]
    SafetyLimitExceeded(String),

    /// A node inside a nested construct failed and took the construct down with it
    #[error("'{key}' failed: {error}")]
    Child {
        key: String,
        #[source]
        error: Box<NodeError>,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn child(key: impl Into<String>, error: NodeError) -> Self {
        NodeError::Child {
            key: key.into(),
            error: Box::new(error),
        }
    }

    /// Innermost error, skipping nested construct wrappers
    pub fn root_cause(&self) -> &NodeError {
        match self {
            NodeError::Child { error, .. } => error.root_cause(),
            other => other,
        }
    }

    /// Kind label recorded in the trace, e.g. `InvocationError.upstream_5xx`
    pub fn kind_label(&self) -> String {
        match self.root_cause() {
            NodeError::ConfigResolution(_) => "ConfigResolutionError".to_string(),
            NodeError::Invocation(e) => format!("InvocationError.{}", e.kind),
            NodeError::SafetyLimitExceeded(_) => "SafetyLimitExceeded".to_string(),
            NodeError::Cancelled => "Cancelled".to_string(),
            NodeError::Child { .. } => "NodeError".to_string(),
        }
    }

    /// Message of the innermost error
    pub fn root_message(&self) -> String {
        self.root_cause().to_string()
    }

    /// The invocation error the retry filters should look at, if any
    pub fn retry_candidate(&self) -> Option<&InvocationError> {
        match self.root_cause() {
            NodeError::Invocation(e) => Some(e),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.retry_candidate().and_then(|e| e.status_code)
    }

    /// Keys of the nested nodes the failure travelled through, outermost first
    pub fn nested_path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self;
        while let NodeError::Child { key, error } = current {
            path.push(key.clone());
            current = error;
        }
        path
    }
}

/// Error detail stored on node records and in the run failure summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Nested node keys the error passed through before reaching this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<String>,
}

impl From<&NodeError> for ErrorDetail {
    fn from(error: &NodeError) -> Self {
        Self {
            kind: error.kind_label(),
            message: error.root_message(),
            status_code: error.status_code(),
            nested: error.nested_path(),
        }
    }
}
