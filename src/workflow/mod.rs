/// Workflow Management Layer
///
/// This module handles workflow definitions, validation, persistence, and the
/// hot-reload registry:
/// - Type definitions (workflows, nodes, connections, policies)
/// - Typed node catalog and compiled graphs
/// - Graph validation with petgraph
/// - SQLite persistence for workflows, credentials and run history
/// - Lock-free hot-reload registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Node catalog, typed control-flow configs and compiled graphs
pub mod nodes;

// Graph validation and compilation
pub mod validate;

// SQLite persistence layer for workflows and credentials
pub mod storage;

// Append-only run history
pub mod history;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use nodes::{CompiledGraph, NodeKind};
pub use types::{Connection, NodeDefinition, RetryPolicy, RunMode, WorkflowDefinition};
pub use validate::GraphValidationError;
