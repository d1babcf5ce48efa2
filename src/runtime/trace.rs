/// Execution trace store
///
/// Append/replace log of node execution records for one run. Nested constructs
/// record their inner nodes under scoped keys (`loop1[2]/log`), so records from
/// concurrent iterations never collide. The store is the only state shared
/// between concurrently running branches.

use crate::runtime::error::{ErrorDetail, NodeError};
use crate::workflow::types::{NodeDefinition, RunMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use uuid::Uuid;

/// Lifecycle status of a single node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One node's execution as observed by the walker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    /// Scoped key, unique within the run
    pub key: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: NodeStatus,
    /// Invocation attempts made (0 for skipped nodes)
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// True when the failure was routed through the node's `error` handle
    #[serde(default)]
    pub handled: bool,
}

impl NodeExecutionRecord {
    pub fn pending(key: impl Into<String>, node: &NodeDefinition) -> Self {
        Self {
            key: key.into(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            name: node.name.clone(),
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            input: None,
            output: None,
            error: None,
            handled: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Human-readable cause chain of a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub node_id: String,
    pub kind: String,
    pub message: String,
    /// Outermost node first, root cause last
    pub chain: Vec<String>,
}

impl RunFailure {
    pub fn from_error(node_id: &str, error: &NodeError) -> Self {
        let kind = error.kind_label();
        let message = error.root_message();
        let mut chain = vec![node_id.to_string()];
        chain.extend(error.nested_path());
        chain.push(format!("{}: {}", kind, message));
        Self {
            node_id: node_id.to_string(),
            kind,
            message,
            chain,
        }
    }
}

/// Result of one workflow run: final outputs plus the full trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub nodes: Vec<NodeExecutionRecord>,
    /// Top-level node outputs keyed by node id
    pub outputs: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl RunRecord {
    /// Record by scoped key
    pub fn node(&self, key: &str) -> Option<&NodeExecutionRecord> {
        self.nodes.iter().find(|record| record.key == key)
    }

    /// All records of a node id, across every scope it ran in
    pub fn records_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeExecutionRecord> {
        self.nodes.iter().filter(move |record| record.node_id == node_id)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            mode: self.mode,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Listing view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TraceInner {
    records: Vec<NodeExecutionRecord>,
    index: HashMap<String, usize>,
}

/// Mutex-guarded trace of one run, one record per scoped key
#[derive(Debug, Default)]
pub struct TraceStore {
    inner: Mutex<TraceInner>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record stored under `record.key`
    pub fn upsert(&self, record: NodeExecutionRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.index.get(&record.key).copied() {
            Some(position) => inner.records[position] = record,
            None => {
                let position = inner.records.len();
                inner.index.insert(record.key.clone(), position);
                inner.records.push(record);
            }
        }
    }

    /// Replace a record with an updated copy of itself
    pub fn update<F>(&self, key: &str, apply: F)
    where
        F: FnOnce(&mut NodeExecutionRecord),
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(position) = inner.index.get(key).copied() {
            let mut record = inner.records[position].clone();
            apply(&mut record);
            inner.records[position] = record;
        }
    }

    pub fn get(&self, key: &str) -> Option<NodeExecutionRecord> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .index
            .get(key)
            .map(|position| inner.records[*position].clone())
    }

    /// Record a node as skipped unless it already has a finished record
    pub fn skip(&self, key: &str, node: &NodeDefinition) {
        let already_finished = self.get(key).is_some_and(|record| record.is_finished());
        if !already_finished {
            let mut record = NodeExecutionRecord::pending(key, node);
            record.status = NodeStatus::Skipped;
            self.upsert(record);
        }
    }

    /// All records in first-insertion order
    pub fn records(&self) -> Vec<NodeExecutionRecord> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.records.clone()
    }
}
