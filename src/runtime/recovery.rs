/// Recovery-strategy nodes
///
/// An `errorRecovery` node protects an embedded sub-graph with one strategy:
/// retry, fallback, circuit breaker, dead-letter queue, or a hybrid of them. The
/// outcome is routed to `success`, `fallback`, `circuit_open` or `dlq_sent`.
/// Circuit-breaker state outlives runs and is keyed by workflow and node path,
/// so every loop iteration of a node shares one circuit.

use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::{error_payload, ExecutionEngine, NodeOutput, RunScope, Scope};
use crate::runtime::error::{ErrorDetail, InvocationError, NodeError};
use crate::runtime::resilience::{self, Attempted};
use crate::runtime::template;
use crate::workflow::nodes::{
    CircuitBreakerConfig, CompiledGraph, DlqConfig, RecoveryConfig, RecoveryStrategy,
};
use crate::workflow::types::RetryPolicy;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

/// State of one circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { trials: u32 },
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Circuit breakers shared by every run of an engine
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    /// Whether a call may go through; moves open circuits to half-open once the
    /// recovery timeout has passed
    pub fn admit(&self, key: &str, config: &CircuitBreakerConfig) -> bool {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { since } => {
                if since.elapsed() >= Duration::from_millis(config.recovery_timeout_ms) {
                    tracing::info!("🔌 Circuit '{}' half-open, allowing a trial call", key);
                    *state = BreakerState::HalfOpen { trials: 1 };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { trials } => {
                if trials < config.half_open_max_calls.max(1) {
                    *state = BreakerState::HalfOpen { trials: trials + 1 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(key.to_string(), BreakerState::Closed { failures: 0 });
    }

    pub fn record_failure(&self, key: &str, config: &CircuitBreakerConfig) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 < config.failure_threshold.max(1) => {
                BreakerState::Closed {
                    failures: failures + 1,
                }
            }
            BreakerState::Open { since } => BreakerState::Open { since },
            _ => {
                tracing::warn!("🔌 Circuit '{}' opened", key);
                BreakerState::Open {
                    since: Instant::now(),
                }
            }
        };
    }

    pub fn state(&self, key: &str) -> Option<BreakerState> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(key).copied()
    }

    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}

/// Message delivered to the dead-letter endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter<'a> {
    run_id: String,
    workflow_id: &'a str,
    node_id: &'a str,
    error: ErrorDetail,
    input: &'a Value,
    timestamp: String,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_recovery(
        &self,
        run: &RunScope,
        key: &str,
        config: &RecoveryConfig,
        protected: &CompiledGraph,
        fallback: Option<&CompiledGraph>,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
    ) -> Result<NodeOutput, NodeError> {
        let breaker_key = format!("{}::{}", run.workflow_id, node_path(key));
        let breaker = config.circuit_breaker_config.clone().unwrap_or_default();

        match config.strategy {
            RecoveryStrategy::Retry => {
                let attempted = self.run_protected_with_retry(run, key, config, protected, ctx, scope).await;
                attempted.result.map(|value| NodeOutput::on("success", value))
            }
            RecoveryStrategy::Fallback => {
                match self.run_protected(run, key, config, protected, ctx, scope).await {
                    Ok(value) => Ok(NodeOutput::on("success", value)),
                    Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
                    Err(error) => self.run_fallback(run, key, config, fallback, ctx, scope, &error).await,
                }
            }
            RecoveryStrategy::CircuitBreaker => {
                if !self.breakers.admit(&breaker_key, &breaker) {
                    return Ok(circuit_open(key, &breaker));
                }
                match self.run_protected(run, key, config, protected, ctx, scope).await {
                    Ok(value) => {
                        self.breakers.record_success(&breaker_key);
                        Ok(NodeOutput::on("success", value))
                    }
                    Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
                    Err(error) => {
                        self.breakers.record_failure(&breaker_key, &breaker);
                        Err(error)
                    }
                }
            }
            RecoveryStrategy::DeadLetterQueue => {
                match self.run_protected(run, key, config, protected, ctx, scope).await {
                    Ok(value) => Ok(NodeOutput::on("success", value)),
                    Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
                    Err(error) => self.dead_letter(run, key, config, ctx, scope, input, error).await,
                }
            }
            RecoveryStrategy::Hybrid => {
                let guarded = config.circuit_breaker_config.is_some();
                if guarded && !self.breakers.admit(&breaker_key, &breaker) {
                    if config.fallback_config.is_some() {
                        let error = NodeError::Invocation(InvocationError::internal(format!(
                            "circuit for '{}' is open",
                            key
                        )));
                        return self.run_fallback(run, key, config, fallback, ctx, scope, &error).await;
                    }
                    return Ok(circuit_open(key, &breaker));
                }

                let attempted = self.run_protected_with_retry(run, key, config, protected, ctx, scope).await;
                let error = match attempted.result {
                    Ok(value) => {
                        if guarded {
                            self.breakers.record_success(&breaker_key);
                        }
                        return Ok(NodeOutput::on("success", value));
                    }
                    Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
                    Err(error) => error,
                };
                if guarded {
                    self.breakers.record_failure(&breaker_key, &breaker);
                }

                if config.fallback_config.is_some() {
                    self.run_fallback(run, key, config, fallback, ctx, scope, &error).await
                } else if config.dlq_config.is_some() {
                    self.dead_letter(run, key, config, ctx, scope, input, error).await
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn run_protected(
        &self,
        run: &RunScope,
        key: &str,
        config: &RecoveryConfig,
        protected: &CompiledGraph,
        ctx: &ExecutionContext,
        scope: &Scope,
    ) -> Result<Value, NodeError> {
        let nested = scope.nested(key);
        self.run_body(
            run,
            protected,
            ctx.child(Vec::<(String, Value)>::new()),
            &nested,
            config.protected.output_source.as_deref(),
        )
        .await
    }

    async fn run_protected_with_retry(
        &self,
        run: &RunScope,
        key: &str,
        config: &RecoveryConfig,
        protected: &CompiledGraph,
        ctx: &ExecutionContext,
        scope: &Scope,
    ) -> Attempted<Value> {
        let policy = RetryPolicy::from(&config.retry_config.clone().unwrap_or_default());
        resilience::run_with_retry(key, Some(&policy), None, &scope.cancel, move |_| {
            self.run_protected(run, key, config, protected, ctx, scope)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fallback(
        &self,
        run: &RunScope,
        key: &str,
        config: &RecoveryConfig,
        fallback: Option<&CompiledGraph>,
        ctx: &ExecutionContext,
        scope: &Scope,
        error: &NodeError,
    ) -> Result<NodeOutput, NodeError> {
        let Some(fallback_config) = &config.fallback_config else {
            return Err(error.clone());
        };
        tracing::warn!(
            "🛟 Recovery '{}' falling back after: {}",
            key,
            error.root_message()
        );
        let child = ctx.child([(
            "error".to_string(),
            error_payload(key, &ErrorDetail::from(error)),
        )]);

        let value = match fallback {
            Some(graph) => {
                let nested = scope.nested(format!("{}[fallback]", key));
                self.run_body(run, graph, child, &nested, fallback_config.output_source.as_deref())
                    .await?
            }
            None => match &fallback_config.fallback_data {
                Some(data) => template::resolve_value(data, &child)?,
                None => Value::Null,
            },
        };
        Ok(NodeOutput::on("fallback", value))
    }

    /// Deliver the failure to the dead-letter endpoint; a failed delivery fails
    /// the node with the original error
    #[allow(clippy::too_many_arguments)]
    async fn dead_letter(
        &self,
        run: &RunScope,
        key: &str,
        config: &RecoveryConfig,
        ctx: &ExecutionContext,
        scope: &Scope,
        input: &Value,
        error: NodeError,
    ) -> Result<NodeOutput, NodeError> {
        let Some(dlq) = &config.dlq_config else {
            return Err(error);
        };
        let letter = DeadLetter {
            run_id: run.run_id.to_string(),
            workflow_id: &run.workflow_id,
            node_id: key,
            error: ErrorDetail::from(&error),
            input,
            timestamp: Utc::now().to_rfc3339(),
        };
        match self.deliver_dead_letter(run, dlq, ctx, scope, &letter).await {
            Ok(receipt) => Ok(NodeOutput::on("dlq_sent", receipt)),
            Err(delivery) => {
                tracing::error!(
                    "❌ Dead-letter delivery for '{}' failed: {}",
                    key,
                    delivery
                );
                Err(error)
            }
        }
    }

    async fn deliver_dead_letter(
        &self,
        run: &RunScope,
        dlq: &DlqConfig,
        ctx: &ExecutionContext,
        scope: &Scope,
        letter: &DeadLetter<'_>,
    ) -> Result<Value, NodeError> {
        let endpoint = template::resolve_string(&dlq.dlq_endpoint, ctx)?;
        let payload = serde_json::to_value(letter)
            .map_err(|e| InvocationError::internal(format!("dead letter not serializable: {}", e)))?;

        if run.mode.is_simulation() {
            tracing::info!("🎭 Simulated dead letter to {}: {}", endpoint, payload);
            return Ok(json!({
                "delivered": false,
                "simulated": true,
                "endpoint": endpoint,
                "payload": payload,
            }));
        }

        let mut headers = Vec::with_capacity(dlq.headers.len());
        for (name, value) in &dlq.headers {
            headers.push((name.clone(), template::stringify(&template::resolve_value(value, ctx)?)));
        }

        let attempts = dlq.dlq_retries.max(1);
        let timeout = Duration::from_millis(self.config.webhook_timeout_ms);
        let mut last_error = InvocationError::internal("dead letter never sent");
        for attempt in 1..=attempts {
            let mut request = self.http.post(&endpoint).timeout(timeout).json(&payload);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("📮 Dead letter delivered to {} (attempt {})", endpoint, attempt);
                    return Ok(json!({
                        "delivered": true,
                        "endpoint": endpoint,
                        "attempts": attempt,
                        "payload": payload,
                    }));
                }
                Ok(response) => {
                    last_error = InvocationError::from_status(
                        response.status().as_u16(),
                        format!("dead-letter endpoint returned {}", response.status()),
                    );
                }
                Err(e) => {
                    last_error = InvocationError::internal(format!("dead-letter delivery failed: {}", e));
                }
            }
            tracing::warn!(
                "⚠️ Dead letter attempt {}/{} to {} failed: {}",
                attempt,
                attempts,
                endpoint,
                last_error
            );
            if attempt < attempts
                && !resilience::backoff(Duration::from_millis(100 * u64::from(attempt)), &scope.cancel).await
            {
                return Err(NodeError::Cancelled);
            }
        }
        Err(last_error.into())
    }
}

/// Scoped key without iteration indexes: `loop[3]/guard` becomes `loop/guard`
fn node_path(key: &str) -> String {
    let mut path = String::with_capacity(key.len());
    let mut rest = key;
    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        let inner = &rest[open + 1..open + close];
        path.push_str(&rest[..open]);
        if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&rest[open..=open + close]);
        }
        rest = &rest[open + close + 1..];
    }
    path.push_str(rest);
    path
}

fn circuit_open(key: &str, config: &CircuitBreakerConfig) -> NodeOutput {
    tracing::warn!("🔌 Circuit for '{}' is open, skipping protected nodes", key);
    NodeOutput::on(
        "circuit_open",
        json!({
            "circuitOpen": true,
            "nodeId": key,
            "recoveryTimeoutMs": config.recovery_timeout_ms,
        }),
    )
}
