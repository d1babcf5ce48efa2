/// Resilience wrapper
///
/// Drives the attempts of one node: per-attempt timeout, retry filtering with
/// exponential backoff, cancellation, and the fire-and-forget on-error webhook.
/// Attempts are strictly sequential.

use crate::runtime::context::ExecutionContext;
use crate::runtime::error::{InvocationError, NodeError};
use crate::runtime::template;
use crate::workflow::types::{OnErrorWebhook, RetryPolicy, RunMode, WebhookMethod};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

/// Result of running a node through the wrapper
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, NodeError>,
    /// Number of attempts actually started
    pub attempts: u32,
}

/// Race one attempt against cancellation and an optional timeout
pub async fn guarded<T, Fut>(
    attempt: Fut,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<T, NodeError>
where
    Fut: Future<Output = Result<T, NodeError>>,
{
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or_else(|_| Err(InvocationError::timeout(limit).into())),
            None => attempt.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NodeError::Cancelled),
        result = bounded => result,
    }
}

/// Sleep unless cancelled first; returns false when cancelled
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Whether `error` should be retried after `attempt` under `policy`
pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &NodeError) -> bool {
    if attempt >= policy.attempts {
        return false;
    }
    match error.retry_candidate() {
        Some(candidate) => policy.matches(candidate.status_code, &candidate.message),
        None => false,
    }
}

/// Run `attempt` until it succeeds, fails fatally, or the policy is exhausted
///
/// `attempt` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    node_id: &str,
    policy: Option<&RetryPolicy>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let mut number = 1;
    loop {
        let result = guarded(attempt(number), timeout, cancel).await;
        let error = match result {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: number,
                }
            }
            Err(error) => error,
        };

        let retry = policy.filter(|p| should_retry(p, number, &error));
        let Some(policy) = retry else {
            return Attempted {
                result: Err(error),
                attempts: number,
            };
        };

        let delay = policy.delay_after(number);
        tracing::warn!(
            node_id,
            attempt = number,
            "🔁 Attempt {}/{} failed: {}; retrying in {:?}",
            number,
            policy.attempts,
            error.root_message(),
            delay
        );
        if !backoff(delay, cancel).await {
            return Attempted {
                result: Err(NodeError::Cancelled),
                attempts: number,
            };
        }
        number += 1;
    }
}

/// Default payload of the on-error webhook
#[derive(Debug, Clone, Serialize)]
pub struct FailureNotice {
    pub failed_node_id: String,
    pub failed_node_name: String,
    pub error_message: String,
    pub timestamp: String,
    pub workflow_data_snapshot: Value,
}

impl FailureNotice {
    pub fn new(node_id: &str, node_name: &str, error: &NodeError, snapshot: Value) -> Self {
        Self {
            failed_node_id: node_id.to_string(),
            failed_node_name: node_name.to_string(),
            error_message: error.root_message(),
            timestamp: Utc::now().to_rfc3339(),
            workflow_data_snapshot: snapshot,
        }
    }

    fn as_locals(&self) -> Vec<(String, Value)> {
        vec![
            ("failed_node_id".to_string(), json!(self.failed_node_id)),
            ("failed_node_name".to_string(), json!(self.failed_node_name)),
            ("error_message".to_string(), json!(self.error_message)),
            ("timestamp".to_string(), json!(self.timestamp)),
            ("workflow_data_snapshot".to_string(), self.workflow_data_snapshot.clone()),
        ]
    }
}

/// Resolve the hook definition with the failure fields in scope
fn resolve_hook(
    raw: &Value,
    ctx: &ExecutionContext,
    notice: &FailureNotice,
) -> Result<(OnErrorWebhook, Value), String> {
    let scope = ctx.child(notice.as_locals());
    let resolved = template::resolve_value(raw, &scope).map_err(|e| e.to_string())?;
    let hook: OnErrorWebhook = serde_json::from_value(resolved).map_err(|e| e.to_string())?;
    let body = match &hook.body_template {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or_else(|_| json!(text)),
        Some(body) => body.clone(),
        None => serde_json::to_value(notice).map_err(|e| e.to_string())?,
    };
    Ok((hook, body))
}

/// Send the on-error notification on a detached task
///
/// Never awaited by the caller; failures are only logged. In simulate mode the
/// notification is logged instead of sent.
pub fn fire_error_webhook(
    http: &reqwest::Client,
    raw: &Value,
    ctx: &ExecutionContext,
    notice: FailureNotice,
    mode: RunMode,
    timeout: Duration,
) {
    let (hook, body) = match resolve_hook(raw, ctx, &notice) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(
                "⚠️ Skipping error webhook for node {}: {}",
                notice.failed_node_id,
                e
            );
            return;
        }
    };

    if mode.is_simulation() {
        tracing::info!(
            "🎭 Simulated error webhook {:?} {} for node {}: {}",
            hook.method,
            hook.url,
            notice.failed_node_id,
            body
        );
        return;
    }

    let client = http.clone();
    let node_id = notice.failed_node_id;
    tokio::spawn(async move {
        let mut request = match hook.method {
            WebhookMethod::Post => client.post(&hook.url),
            WebhookMethod::Put => client.put(&hook.url),
        };
        for (key, value) in &hook.headers {
            request = request.header(key.as_str(), template::stringify(value));
        }
        match request.timeout(timeout).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("📣 Error webhook delivered for node {}", node_id);
            }
            Ok(response) => {
                tracing::warn!(
                    "⚠️ Error webhook for node {} returned HTTP {}",
                    node_id,
                    response.status()
                );
            }
            Err(e) => {
                tracing::warn!("⚠️ Error webhook for node {} failed: {}", node_id, e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::ConfigResolutionError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn policy(attempts: u32, delay_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay_ms,
            backoff_factor: factor,
            retry_on_status_codes: vec![],
            retry_on_error_keywords: vec![],
        }
    }

    #[tokio::test]
    async fn retries_with_exponential_backoff_then_fails() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let outcome: Attempted<Value> = run_with_retry(
            "flaky",
            Some(&policy(3, 50, 2.0)),
            None,
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(InvocationError::from_status(503, "unavailable").into()) }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn config_errors_are_never_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let outcome: Attempted<Value> = run_with_retry("n", Some(&policy(5, 0, 1.0)), None, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConfigResolutionError::MissingEnv("X".into()).into()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn status_filter_blocks_non_matching_errors() {
        let mut filtered = policy(3, 0, 1.0);
        filtered.retry_on_status_codes = vec![503];
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let _: Attempted<Value> = run_with_retry("n", Some(&filtered), None, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(InvocationError::from_status(400, "bad").into()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_time_out() {
        let cancel = CancellationToken::new();
        let outcome: Attempted<Value> = run_with_retry(
            "slow",
            None,
            Some(Duration::from_millis(20)),
            &cancel,
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            },
        )
        .await;
        let error = outcome.result.unwrap_err();
        assert_eq!(error.kind_label(), "InvocationError.timeout");
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let outcome: Attempted<Value> =
            run_with_retry("n", Some(&policy(3, 10_000, 1.0)), None, &cancel, |_| async {
                Err(InvocationError::internal("boom").into())
            })
            .await;
        assert!(matches!(outcome.result, Err(NodeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
