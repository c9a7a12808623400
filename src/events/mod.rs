//! Metrics and audit event emission.
//!
//! The coordinator emits one event per tool result and one per plan
//! aggregation. Sinks are fire-and-forget: a misbehaving sink must never
//! fail the caller's request, so `record` is infallible and sinks swallow
//! their own errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// What the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolInvocation,
    PlanExecution,
}

/// One emitted metrics/audit record.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorEvent {
    pub kind: EventKind,
    /// Tool id for invocations, plan id for aggregations.
    pub subject: String,
    pub tenant_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CoordinatorEvent {
    pub fn tool_invocation(
        tool_id: impl Into<String>,
        tenant_id: impl Into<String>,
        success: bool,
        latency_ms: u64,
        retry_count: u32,
    ) -> Self {
        Self {
            kind: EventKind::ToolInvocation,
            subject: tool_id.into(),
            tenant_id: tenant_id.into(),
            success,
            latency_ms,
            retry_count,
            timestamp: Utc::now(),
        }
    }

    pub fn plan_execution(
        plan_id: impl Into<String>,
        tenant_id: impl Into<String>,
        success: bool,
        latency_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::PlanExecution,
            subject: plan_id.into(),
            tenant_id: tenant_id.into(),
            success,
            latency_ms,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget metrics/audit sink.
///
/// Implementations must not block the caller; anything slow belongs on a
/// task the sink spawns itself.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn record(&self, event: CoordinatorEvent);
}

/// Sink that forwards events to structured tracing output.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: CoordinatorEvent) {
        tracing::info!(
            kind = ?event.kind,
            subject = %event.subject,
            tenant = %event.tenant_id,
            success = event.success,
            latency_ms = event.latency_ms,
            retries = event.retry_count,
            "coordinator event"
        );
    }
}

/// Sink that drops everything. Useful in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _event: CoordinatorEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        let event = CoordinatorEvent::tool_invocation("checkout", "merchant-1", true, 120, 1);
        assert_eq!(event.kind, EventKind::ToolInvocation);
        assert_eq!(event.subject, "checkout");
        assert_eq!(event.retry_count, 1);

        let event = CoordinatorEvent::plan_execution("plan-9", "merchant-1", false, 900);
        assert_eq!(event.kind, EventKind::PlanExecution);
        assert!(!event.success);
    }

    #[test]
    fn test_event_serializes_snake_case_kind() {
        let event = CoordinatorEvent::tool_invocation("checkout", "merchant-1", true, 1, 0);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"tool_invocation\""));
    }

    #[test]
    fn test_null_sink_accepts_events() {
        let sink = NullSink;
        sink.record(CoordinatorEvent::plan_execution("p", "t", true, 0));
    }
}
