//! Invocation executor — one tool call end-to-end.
//!
//! Order of gates for each invocation: definition lookup, bulkhead
//! admission, circuit breaker, then the remote call with its own timeout
//! and bounded retries. Every error is captured as a string on the
//! `ToolResult`; nothing is thrown past this layer, so the plan coordinator
//! can always make forward progress with partial results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::breaker::{BreakerOutcome, CircuitBreaker};
use crate::bulkhead::TenantBulkheads;
use crate::events::{CoordinatorEvent, MetricsSink};
use crate::sync::lock_unpoisoned;
use crate::tools::registry::{ToolConnector, ToolDefinition};
use crate::tools::{ToolHealthTracker, ToolRegistry};
use crate::types::{Error, InvocationId, Result, RetryConfig, TenantId, ToolId};

/// One attempt request. Ephemeral, created per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub invocation_id: InvocationId,
    pub tool_id: ToolId,
    /// Opaque key/value parameters passed through to the connector.
    pub parameters: Value,
    pub tenant_id: TenantId,
    pub priority: u32,
    /// Per-call override of the tool's timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Per-call override of the tool's retry policy.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ToolInvocation {
    pub fn new(tool_id: ToolId, tenant_id: TenantId, parameters: Value) -> Self {
        Self {
            invocation_id: InvocationId::new(),
            tool_id,
            parameters,
            tenant_id,
            priority: 5,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Outcome of one invocation. Ephemeral; returned to the caller, not
/// persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: InvocationId,
    pub tool_id: ToolId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// True when the payload came from the degraded-mode fallback rather
    /// than the tool itself.
    pub fallback: bool,
    /// Wall-clock from admission to completion.
    pub latency_ms: u64,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl ToolResult {
    pub(crate) fn succeeded(
        invocation: &ToolInvocation,
        payload: Value,
        fallback: bool,
        latency_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            invocation_id: invocation.invocation_id.clone(),
            tool_id: invocation.tool_id.clone(),
            success: true,
            result: Some(payload),
            error: None,
            fallback,
            latency_ms,
            retry_count,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn failed(
        invocation: &ToolInvocation,
        error: impl Into<String>,
        latency_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            invocation_id: invocation.invocation_id.clone(),
            tool_id: invocation.tool_id.clone(),
            success: false,
            result: None,
            error: Some(error.into()),
            fallback: false,
            latency_ms,
            retry_count,
            timestamp: Utc::now(),
        }
    }
}

/// Executes single invocations against the registry, guarded by the
/// tenant bulkhead and the per-tool circuit breaker.
#[derive(Debug)]
pub struct InvocationExecutor {
    registry: Arc<ToolRegistry>,
    breakers: Arc<CircuitBreaker>,
    bulkheads: Arc<TenantBulkheads>,
    tracker: Arc<Mutex<ToolHealthTracker>>,
    sink: Arc<dyn MetricsSink>,
}

impl InvocationExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breakers: Arc<CircuitBreaker>,
        bulkheads: Arc<TenantBulkheads>,
        tracker: Arc<Mutex<ToolHealthTracker>>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            breakers,
            bulkheads,
            tracker,
            sink,
        }
    }

    /// Run one invocation end-to-end. Infallible by contract: every error
    /// lands on the returned `ToolResult`.
    pub async fn invoke(&self, invocation: &ToolInvocation) -> ToolResult {
        let started = Instant::now();

        let Some((definition, connector)) = self.registry.get(&invocation.tool_id) else {
            let err = Error::tool_not_found(invocation.tool_id.as_str());
            tracing::warn!(tool = %invocation.tool_id, "invocation for unregistered tool");
            let result = ToolResult::failed(invocation, err.to_string(), 0, 0);
            self.emit(invocation, &result);
            return result;
        };

        // Admission before the breaker and before any network call, so
        // saturation fails fast without consuming breaker failure budget.
        // The permit releases on drop: a caller cancelling this future
        // mid-call still returns the slot.
        let permit = match self
            .bulkheads
            .try_acquire(&invocation.tenant_id, &definition.bulkhead)
        {
            Ok(permit) => permit,
            Err(err) => {
                let result = ToolResult::failed(invocation, err.to_string(), 0, 0);
                self.record_health(invocation, &result, Some(err.kind()));
                self.emit(invocation, &result);
                return result;
            }
        };

        let timeout = invocation.timeout.unwrap_or(definition.timeout);
        let retry = invocation
            .retry
            .clone()
            .unwrap_or_else(|| definition.retry.clone());
        let attempts = AtomicU32::new(0);

        let outcome = self
            .breakers
            .call_with_breaker(
                invocation.tool_id.as_str(),
                &definition.circuit_breaker,
                || {
                    run_with_retries(
                        connector.clone(),
                        &definition,
                        invocation,
                        timeout,
                        &retry,
                        &attempts,
                    )
                },
                || async {
                    Ok(json!({
                        "fallback": true,
                        "tool_id": invocation.tool_id.as_str(),
                        "message": "circuit open; degraded response returned",
                    }))
                },
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let retry_count = attempts.load(Ordering::SeqCst);

        let (result, error_kind) = match outcome {
            Ok(BreakerOutcome::Executed(payload)) => (
                ToolResult::succeeded(invocation, payload, false, latency_ms, retry_count),
                None,
            ),
            Ok(BreakerOutcome::Fallback(payload)) => (
                ToolResult::succeeded(invocation, payload, true, latency_ms, retry_count),
                None,
            ),
            Err(err) => {
                tracing::warn!(
                    tool = %invocation.tool_id,
                    tenant = %invocation.tenant_id,
                    error = %err,
                    "invocation failed"
                );
                let kind = err.kind();
                (
                    ToolResult::failed(invocation, err.to_string(), latency_ms, retry_count),
                    Some(kind),
                )
            }
        };

        // Errors are values past this point, so completing here covers
        // success, failure and timeout alike; cancellation releases via the
        // permit's drop instead.
        permit.complete(result.success, latency_ms);

        self.record_health(invocation, &result, error_kind);
        self.emit(invocation, &result);
        result
    }

    fn record_health(
        &self,
        invocation: &ToolInvocation,
        result: &ToolResult,
        error_kind: Option<&'static str>,
    ) {
        lock_unpoisoned(&self.tracker).record_execution(
            invocation.tool_id.as_str(),
            result.success,
            result.latency_ms,
            error_kind.map(str::to_string),
        );
    }

    fn emit(&self, invocation: &ToolInvocation, result: &ToolResult) {
        self.sink.record(CoordinatorEvent::tool_invocation(
            invocation.tool_id.as_str(),
            invocation.tenant_id.as_str(),
            result.success,
            result.latency_ms,
            result.retry_count,
        ));
    }
}

/// Perform the remote call with bounded retries and exponential backoff.
/// One exhausted attempt set surfaces as one breaker failure.
async fn run_with_retries(
    connector: Arc<dyn ToolConnector>,
    definition: &ToolDefinition,
    invocation: &ToolInvocation,
    timeout: Duration,
    retry: &RetryConfig,
    attempts: &AtomicU32,
) -> Result<Value> {
    let mut delay = retry.backoff;
    let mut last_err: Option<Error> = None;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            attempts.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                tool = %definition.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * retry.backoff_multiplier);
        }

        match tokio::time::timeout(
            timeout,
            connector.execute(&invocation.tool_id, &invocation.parameters, timeout),
        )
        .await
        {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                // Connector errors reached the dependency: coerce anything
                // that isn't already a remote failure so breaker accounting
                // stays unambiguous.
                last_err = Some(if err.counts_against_breaker() {
                    err
                } else {
                    Error::remote_call_failed(err.to_string())
                });
            }
            Err(_elapsed) => {
                last_err = Some(Error::timeout(format!(
                    "tool {} exceeded {}ms",
                    invocation.tool_id,
                    timeout.as_millis()
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::internal("retry loop produced no outcome")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Connector that fails a fixed number of times, then succeeds.
    #[derive(Debug)]
    struct FlakyConnector {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    impl FlakyConnector {
        fn new(failures_before_success: usize) -> Self {
            Self {
                failures_before_success,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolConnector for FlakyConnector {
        async fn execute(
            &self,
            _tool_id: &ToolId,
            _parameters: &Value,
            _timeout: Duration,
        ) -> Result<Value> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(Error::remote_call_failed("upstream 503"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    #[derive(Debug)]
    struct SlowConnector;

    #[async_trait]
    impl ToolConnector for SlowConnector {
        async fn execute(
            &self,
            _tool_id: &ToolId,
            _parameters: &Value,
            _timeout: Duration,
        ) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn executor_with(connector: Arc<dyn ToolConnector>, definition: ToolDefinition) -> InvocationExecutor {
        let tracker = Arc::new(Mutex::new(ToolHealthTracker::default()));
        let registry = Arc::new(ToolRegistry::new(tracker.clone()));
        registry.register(definition, connector).unwrap();
        InvocationExecutor::new(
            registry,
            Arc::new(CircuitBreaker::new()),
            Arc::new(TenantBulkheads::new()),
            tracker,
            Arc::new(NullSink),
        )
    }

    fn no_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 0,
            backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    fn definition(id: &str) -> ToolDefinition {
        let mut definition =
            ToolDefinition::new(ToolId::must(id), id, "https://tools.internal/test");
        definition.retry = no_retry();
        definition
    }

    fn invocation(id: &str) -> ToolInvocation {
        ToolInvocation::new(
            ToolId::must(id),
            TenantId::must("merchant-1"),
            json!({"query": "order status"}),
        )
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let executor = executor_with(Arc::new(FlakyConnector::new(0)), definition("retrieval"));
        let result = executor.invoke(&invocation("retrieval")).await;

        assert!(result.success);
        assert!(!result.fallback);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_breaker_touch() {
        let executor = executor_with(Arc::new(FlakyConnector::new(0)), definition("retrieval"));
        let result = executor.invoke(&invocation("nonexistent")).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("tool not found"));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut def = definition("retrieval");
        def.retry = RetryConfig {
            max_retries: 2,
            backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };
        let executor = executor_with(Arc::new(FlakyConnector::new(2)), def);

        let result = executor.invoke(&invocation("retrieval")).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_retry_count() {
        let mut def = definition("retrieval");
        def.retry = RetryConfig {
            max_retries: 1,
            backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        };
        let executor = executor_with(Arc::new(FlakyConnector::new(10)), def);

        let result = executor.invoke(&invocation("retrieval")).await;
        assert!(!result.success);
        assert_eq!(result.retry_count, 1);
        assert!(result.error.as_deref().unwrap().contains("remote call failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_and_releases_slot() {
        let mut def = definition("slow");
        def.timeout = Duration::from_millis(50);
        let executor = executor_with(Arc::new(SlowConnector), def);

        let invocation = invocation("slow");
        let result = executor.invoke(&invocation).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timeout"));

        // Slot released on the timeout path: no leaked admissions.
        let stats = executor.bulkheads.stats(&invocation.tenant_id);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_bulkhead_saturation_reported_distinctly() {
        let mut def = definition("retrieval");
        def.bulkhead.max_concurrent_requests = 1;
        def.bulkhead.queue_size = 0;
        let executor = executor_with(Arc::new(FlakyConnector::new(0)), def.clone());

        // Fill the only slot by hand, then invoke.
        let _slot = executor
            .bulkheads
            .try_acquire(&TenantId::must("merchant-1"), &def.bulkhead)
            .unwrap();

        let result = executor.invoke(&invocation("retrieval")).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("bulkhead saturated"));

        // Rejection never reached the dependency, so the breaker saw nothing.
        assert!(executor.breakers.stats("retrieval").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invocation_releases_slot() {
        let mut def = definition("slow");
        def.timeout = Duration::from_secs(30);
        let executor = executor_with(Arc::new(SlowConnector), def);

        // Caller-side timeout drops the invoke future mid-call.
        let invocation = invocation("slow");
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), executor.invoke(&invocation)).await;
        assert!(cancelled.is_err());

        let stats = executor.bulkheads.stats(&invocation.tenant_id);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_produces_fallback_payload() {
        let mut def = definition("retrieval");
        def.circuit_breaker.failure_threshold = 1;
        def.circuit_breaker.reset_timeout = Duration::from_secs(60);
        let executor = executor_with(Arc::new(FlakyConnector::new(100)), def);

        let first = executor.invoke(&invocation("retrieval")).await;
        assert!(!first.success);

        let second = executor.invoke(&invocation("retrieval")).await;
        assert!(second.success);
        assert!(second.fallback);
        let payload = second.result.unwrap();
        assert_eq!(payload["fallback"], json!(true));
        assert_eq!(payload["tool_id"], json!("retrieval"));
    }

    #[tokio::test]
    async fn test_per_call_timeout_override() {
        let mut def = definition("slow");
        def.timeout = Duration::from_secs(30);
        let executor = executor_with(Arc::new(SlowConnector), def);

        let invocation = invocation("slow").with_timeout(Duration::from_millis(10));
        let result = executor.invoke(&invocation).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timeout"));
    }
}
