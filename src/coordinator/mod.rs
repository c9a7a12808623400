//! Tool coordinator — the public facade.
//!
//! One coordinator instance owns the tool registry, breaker registry,
//! tenant bulkheads and health tracker as explicit dependency-injected
//! mappings (no process-wide singletons), so lifecycle stays explicit and
//! testable.

use std::sync::{Arc, Mutex};

use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::bulkhead::{BulkheadStats, TenantBulkheads};
use crate::events::{MetricsSink, TracingSink};
use crate::executor::{InvocationExecutor, ToolInvocation, ToolResult};
use crate::plan::{CoordinatedPlanResult, ExecutionPlan, PlanCoordinator};
use crate::sync::lock_unpoisoned;
use crate::tools::{
    HealthConfig, SystemHealthReport, ToolConnector, ToolDefinition, ToolHealthReport,
    ToolHealthTracker, ToolRegistry,
};
use crate::types::{CoordinatorConfig, Result, TenantId, ToolId, UserId};

/// Multi-tenant tool coordinator.
///
/// Wraps every tool invocation with bulkhead admission and circuit-breaker
/// health gating, and executes dependency-graph plans with partial-failure
/// aggregation.
#[derive(Debug)]
pub struct ToolCoordinator {
    registry: Arc<ToolRegistry>,
    breakers: Arc<CircuitBreaker>,
    bulkheads: Arc<TenantBulkheads>,
    tracker: Arc<Mutex<ToolHealthTracker>>,
    executor: Arc<InvocationExecutor>,
    plans: PlanCoordinator,
    config: CoordinatorConfig,
}

impl ToolCoordinator {
    /// Coordinator with the default tracing-backed metrics sink.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Coordinator emitting metrics/audit events to a custom sink.
    pub fn with_sink(config: CoordinatorConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let tracker = Arc::new(Mutex::new(ToolHealthTracker::new(HealthConfig::default())));
        let registry = Arc::new(ToolRegistry::new(tracker.clone()));
        let breakers = Arc::new(CircuitBreaker::new());
        let bulkheads = Arc::new(TenantBulkheads::new());

        let executor = Arc::new(InvocationExecutor::new(
            registry.clone(),
            breakers.clone(),
            bulkheads.clone(),
            tracker.clone(),
            sink.clone(),
        ));
        let plans = PlanCoordinator::new(executor.clone(), sink);

        Self {
            registry,
            breakers,
            bulkheads,
            tracker,
            executor,
            plans,
            config,
        }
    }

    /// Definition pre-filled with this coordinator's configured default
    /// policies. Callers override individual fields before registering.
    pub fn define_tool(
        &self,
        id: ToolId,
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> ToolDefinition {
        ToolDefinition::with_policies(id, name, endpoint, &self.config.defaults)
    }

    /// Register a tool definition and its connector. Starts the tool's
    /// probe loop when health checks are enabled.
    pub fn register_tool(
        &self,
        definition: ToolDefinition,
        connector: Arc<dyn ToolConnector>,
    ) -> Result<()> {
        self.registry.register(definition, connector)
    }

    /// Remove a tool and stop its probe loop. Returns false if unknown.
    pub fn deregister_tool(&self, tool_id: &ToolId) -> bool {
        self.registry.deregister(tool_id)
    }

    /// Execute one invocation. Infallible: errors land on the result.
    pub async fn invoke_tool(&self, invocation: &ToolInvocation) -> ToolResult {
        self.executor.invoke(invocation).await
    }

    /// Execute a coordinated plan for a tenant. Err only for structurally
    /// invalid plans (duplicate steps, unknown dependencies, cycles).
    pub async fn execute_coordinated_plan(
        &self,
        plan: &ExecutionPlan,
        tenant_id: &TenantId,
        user_id: Option<&UserId>,
    ) -> Result<CoordinatedPlanResult> {
        self.plans.execute(plan, tenant_id, user_id).await
    }

    /// Health report for one tool: sliding-window execution metrics, last
    /// probe outcome, and current breaker state.
    pub fn get_tool_health(&self, tool_id: &ToolId) -> ToolHealthReport {
        let mut report = lock_unpoisoned(&self.tracker).check_tool_health(tool_id.as_str());
        report.circuit_state = self.breakers.state(tool_id.as_str());
        report
    }

    /// Health report across every registered or executed tool.
    pub fn get_system_health(&self) -> SystemHealthReport {
        let mut report = lock_unpoisoned(&self.tracker).check_system_health();
        for tool_report in &mut report.tool_reports {
            tool_report.circuit_state = self.breakers.state(&tool_report.tool_id);
        }
        report
    }

    /// Bulkhead snapshot for one tenant (zeroed if never seen).
    pub fn get_bulkhead_stats(&self, tenant_id: &TenantId) -> BulkheadStats {
        self.bulkheads.stats(tenant_id)
    }

    /// Breaker snapshot for one tool (None if never invoked).
    pub fn get_breaker_stats(&self, tool_id: &ToolId) -> Option<BreakerStats> {
        self.breakers.stats(tool_id.as_str())
    }

    /// Forcibly close a tool's breaker. Administrative escape hatch.
    pub fn reset_breaker(&self, tool_id: &ToolId) {
        self.breakers.reset(tool_id.as_str());
    }

    pub fn registered_tools(&self) -> Vec<String> {
        self.registry.list_ids()
    }

    /// Stop all background probe loops. Safe to call more than once.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        tracing::info!("coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepId;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Debug)]
    struct StaticConnector(Value);

    #[async_trait]
    impl ToolConnector for StaticConnector {
        async fn execute(
            &self,
            _tool_id: &ToolId,
            _parameters: &Value,
            _timeout: Duration,
        ) -> crate::types::Result<Value> {
            Ok(self.0.clone())
        }
    }

    fn coordinator() -> ToolCoordinator {
        ToolCoordinator::with_sink(
            CoordinatorConfig::default(),
            Arc::new(crate::events::NullSink),
        )
    }

    fn definition(id: &str) -> ToolDefinition {
        ToolDefinition::new(ToolId::must(id), id, "https://tools.internal/test")
    }

    #[tokio::test]
    async fn test_register_invoke_and_report() {
        let coordinator = coordinator();
        coordinator
            .register_tool(
                definition("retrieval"),
                Arc::new(StaticConnector(json!({"documents": []}))),
            )
            .unwrap();

        let invocation = ToolInvocation::new(
            ToolId::must("retrieval"),
            TenantId::must("merchant-1"),
            json!({"query": "refund policy"}),
        );
        let result = coordinator.invoke_tool(&invocation).await;
        assert!(result.success);

        let stats = coordinator.get_bulkhead_stats(&TenantId::must("merchant-1"));
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.active_requests, 0);

        assert_eq!(coordinator.registered_tools(), vec!["retrieval"]);
    }

    #[tokio::test]
    async fn test_tool_health_includes_breaker_state() {
        let coordinator = coordinator();
        coordinator
            .register_tool(
                definition("retrieval"),
                Arc::new(StaticConnector(Value::Null)),
            )
            .unwrap();

        let invocation = ToolInvocation::new(
            ToolId::must("retrieval"),
            TenantId::must("merchant-1"),
            Value::Null,
        );
        coordinator.invoke_tool(&invocation).await;

        let report = coordinator.get_tool_health(&ToolId::must("retrieval"));
        assert_eq!(
            report.circuit_state,
            Some(crate::breaker::CircuitState::Closed)
        );
    }

    #[tokio::test]
    async fn test_plan_execution_through_facade() {
        let coordinator = coordinator();
        coordinator
            .register_tool(
                definition("retrieval"),
                Arc::new(StaticConnector(json!({"ok": true}))),
            )
            .unwrap();

        let plan = ExecutionPlan::parallel(vec![
            crate::plan::PlanStep::new(
                StepId::must("fetch"),
                ToolId::must("retrieval"),
                Value::Null,
            ),
        ]);
        let result = coordinator
            .execute_coordinated_plan(&plan, &TenantId::must("merchant-1"), None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.results.len(), 1);
    }

    #[test]
    fn test_define_tool_applies_configured_defaults() {
        let mut config = CoordinatorConfig::default();
        config.defaults.timeout = Duration::from_secs(3);
        config.defaults.circuit_breaker.failure_threshold = 2;
        config.defaults.bulkhead.max_concurrent_requests = 3;

        let coordinator =
            ToolCoordinator::with_sink(config, Arc::new(crate::events::NullSink));
        let def = coordinator.define_tool(
            ToolId::must("retrieval"),
            "Document retrieval",
            "https://tools.internal/retrieval",
        );

        assert_eq!(def.timeout, Duration::from_secs(3));
        assert_eq!(def.circuit_breaker.failure_threshold, 2);
        assert_eq!(def.bulkhead.max_concurrent_requests, 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let coordinator = coordinator();
        coordinator.shutdown();
        coordinator.shutdown();
    }
}
