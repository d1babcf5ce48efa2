/// Run-scoped execution context
///
/// Holds everything templates can reference while a graph is walked: outputs of
/// nodes that already ran (per node and per output handle), scope-local variables
/// such as `item`/`index`, and the read-only env and credential maps. The context
/// is owned by one walker invocation; nested constructs get a child context and
/// hand results back through their own node output.

use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

/// Execution context for one walker invocation
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Process-level configuration, read-only for the whole run
    env: Arc<HashMap<String, String>>,
    /// Named secrets, read-only for the whole run
    credentials: Arc<HashMap<String, String>>,
    /// Snapshot of the enclosing contexts' node outputs (read-only)
    inherited: Arc<HashMap<String, Value>>,
    /// Recorded output per node id in this context
    outputs: HashMap<String, Value>,
    /// Published value per `nodeId.handle`
    ports: HashMap<String, Value>,
    /// Scope-local variables (input, item, index, loop state, mapped inputs)
    locals: HashMap<String, Value>,
    /// Node ids in completion order
    completed: Vec<String>,
}

fn port_key(node_id: &str, handle: &str) -> String {
    format!("{}.{}", node_id, handle)
}

impl ExecutionContext {
    /// Create a root context for a run
    pub fn new(env: HashMap<String, String>, credentials: HashMap<String, String>) -> Self {
        Self {
            env: Arc::new(env),
            credentials: Arc::new(credentials),
            ..Default::default()
        }
    }

    /// Child context for loop iterations, parallel branches and protected sub-graphs
    ///
    /// The child can read every output visible here and the current locals, but what
    /// it produces stays in the child.
    pub fn child<I>(&self, locals: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut inherited = (*self.inherited).clone();
        for (node_id, value) in &self.outputs {
            inherited.insert(node_id.clone(), value.clone());
        }
        let mut child_locals = self.locals.clone();
        child_locals.extend(locals);
        Self {
            env: Arc::clone(&self.env),
            credentials: Arc::clone(&self.credentials),
            inherited: Arc::new(inherited),
            outputs: HashMap::new(),
            ports: HashMap::new(),
            locals: child_locals,
            completed: Vec::new(),
        }
    }

    /// Isolated context for sub-flows: only env, credentials and the given locals
    pub fn isolated<I>(&self, locals: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            env: Arc::clone(&self.env),
            credentials: Arc::clone(&self.credentials),
            locals: locals.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    pub fn with_locals<I>(mut self, locals: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.locals.extend(locals);
        self
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Credential by name, falling back to conventional env var names
    pub fn credential(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.credentials.get(name) {
            return Some(value.as_str());
        }
        [
            name.to_string(),
            format!("{}_API_KEY", name),
            format!("{}_SECRET", name),
            format!("{}_TOKEN", name),
        ]
        .iter()
        .find_map(|key| self.env(key))
    }

    /// Recorded output of a node, own context first
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs
            .get(node_id)
            .or_else(|| self.inherited.get(node_id))
    }

    pub fn has_output(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
    }

    /// Value published on a node's output handle in this context
    pub fn port(&self, node_id: &str, handle: &str) -> Option<&Value> {
        self.ports.get(&port_key(node_id, handle))
    }

    /// Record a node's output and publish the selected handles
    ///
    /// Outputs are append-only: a node publishes once per context.
    pub fn publish(&mut self, node_id: &str, output: Value, ports: Vec<(String, Value)>) {
        if self.outputs.contains_key(node_id) {
            tracing::warn!("Ignoring second publication for node '{}'", node_id);
            return;
        }
        for (handle, value) in ports {
            self.ports.insert(port_key(node_id, &handle), value);
        }
        self.outputs.insert(node_id.to_string(), output);
        self.completed.push(node_id.to_string());
    }

    /// Output of the node that completed last in this context
    pub fn last_output(&self) -> Option<&Value> {
        self.completed.last().and_then(|id| self.outputs.get(id))
    }

    /// Outputs produced in this context, keyed by node id
    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// All visible node outputs as one JSON object (inherited values first)
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        for (node_id, value) in self.inherited.iter() {
            map.insert(node_id.clone(), value.clone());
        }
        for (node_id, value) in &self.outputs {
            map.insert(node_id.clone(), value.clone());
        }
        Value::Object(map)
    }
}
