/// Runtime Execution Engine
///
/// This module walks validated workflow graphs. It handles:
/// - Template resolution and condition expressions
/// - Capability invocation (built-ins, integrations, simulation)
/// - Retries, timeouts, cancellation and on-error webhooks
/// - Control-flow constructs and recovery strategies
/// - The per-run execution trace

// Graph walker and run entry points
pub mod engine;

// Per-walk data: node outputs, locals, env and credentials
pub mod context;

// `{{ source.path }}` placeholder resolution
pub mod template;

// Branch and loop condition expressions
pub mod expression;

// Capability invoker contract and registry
pub mod invoker;

// Built-in capabilities served by the registry
pub mod capabilities;

// Retry, timeout and on-error webhook wrapper
pub mod resilience;

// Branch, for-each, while, parallel and sub-flow executors
pub mod control;

// Retry / fallback / circuit-breaker / dead-letter nodes
pub mod recovery;

// Node execution records and run results
pub mod trace;

// Error taxonomy
pub mod error;

// Re-export main types
pub use engine::{ExecutionEngine, NodeOutput, RunOptions};
pub use error::{ConfigResolutionError, InvocationError, InvocationErrorKind, NodeError};
pub use invoker::{CapabilityInvoker, InvocationRequest, InvokerRegistry};
pub use trace::{NodeExecutionRecord, NodeStatus, RunRecord, RunStatus, RunSummary};
