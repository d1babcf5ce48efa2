/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory registry of validated
/// workflows. Each update swaps the entire map, so runs already in flight keep
/// the graph they started with.

use crate::workflow::{
    nodes::CompiledGraph, storage::WorkflowStorage, types::WorkflowDefinition, validate,
};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free workflow registry
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// workflow_id → compiled workflow
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    storage: WorkflowStorage,
}

/// Validated workflow ready to run
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Arc<WorkflowDefinition>,
    pub graph: Arc<CompiledGraph>,
    /// Paths of the `webhookTrigger` nodes, without leading slash
    pub webhook_paths: Vec<String>,
}

impl CompiledWorkflow {
    /// Validate a definition and extract its webhook paths
    pub fn compile(workflow: WorkflowDefinition) -> Result<Self, validate::GraphValidationError> {
        let graph = validate::compile(&workflow)?;
        let webhook_paths = workflow
            .nodes
            .iter()
            .filter(|node| node.node_type == "webhookTrigger")
            .filter_map(|node| node.config.get("path").and_then(|p| p.as_str()))
            .map(normalize_path)
            .collect();
        Ok(Self {
            workflow: Arc::new(workflow),
            graph: Arc::new(graph),
            webhook_paths,
        })
    }

    /// Whether a webhook request path reaches this workflow
    ///
    /// Workflows without a configured path accept every path.
    pub fn accepts_webhook(&self, path: &str) -> bool {
        self.webhook_paths.is_empty() || self.webhook_paths.iter().any(|p| p == &normalize_path(path))
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Load and validate every stored workflow
    ///
    /// Workflows that no longer validate are logged and left out.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let mut compiled = HashMap::with_capacity(stored.len());
        for (id, workflow) in stored {
            match CompiledWorkflow::compile(workflow) {
                Ok(workflow) => {
                    compiled.insert(id, workflow);
                }
                Err(e) => tracing::warn!("⚠️ Workflow '{}' failed validation, not loaded: {}", id, e),
            }
        }

        self.workflows.store(Arc::new(compiled));
        tracing::info!(
            "Initialized workflow registry with {} workflows",
            self.workflows.load().len()
        );
        Ok(())
    }

    /// Install an already validated workflow
    pub fn install(&self, compiled: CompiledWorkflow) {
        let id = compiled.workflow.id.clone();
        let current = self.workflows.load();
        let mut next = (**current).clone();
        next.insert(id.clone(), compiled);
        self.workflows.store(Arc::new(next));
        tracing::info!("🔄 Hot-reloaded workflow: {}", id);
    }

    /// Reload one workflow from storage
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;
        self.install(CompiledWorkflow::compile(workflow)?);
        Ok(())
    }

    /// Lock-free read; the clone only bumps reference counts
    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }

    pub fn remove_workflow(&self, workflow_id: &str) {
        let current = self.workflows.load();
        let mut next = (**current).clone();
        if next.remove(workflow_id).is_some() {
            self.workflows.store(Arc::new(next));
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
    }
}
