/// Kairo: workflow execution engine
///
/// Runs node-graph workflows: template resolution, capability invocation with
/// retries and timeouts, control-flow constructs, recovery strategies and a
/// per-node execution trace, behind an axum service with SQLite persistence.

// Core configuration and setup
pub mod config;

// Workflow management layer - definitions, validation, storage and registry
pub mod workflow;

// Runtime execution engine - graph walker, invokers and control flow
pub mod runtime;

// HTTP API layer - workflow management, runs and webhook triggers
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use runtime::{ExecutionEngine, RunOptions, RunRecord, RunStatus};
pub use server::start_server;
pub use workflow::{RunMode, WorkflowDefinition};
