//! Tool registry — definitions, connector handler table, probe lifecycle.
//!
//! Binds a tool id to its operational policy (timeout, retry, breaker,
//! bulkhead, health check) and to the connector that performs the actual
//! remote call. Adding a tool means registering a new entry, never editing
//! a dispatch chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sync::lock_unpoisoned;
use crate::tools::health::{spawn_probe_loop, ProbeHandle, ToolHealthTracker};
use crate::types::{
    BulkheadConfig, CircuitBreakerConfig, DefaultPolicies, Error, HealthCheckConfig, Result,
    RetryConfig, ToolId,
};

/// Uniform asynchronous call abstraction over a remote tool.
///
/// `execute` must return `Err` on failure, never a sentinel value, so the
/// breaker can distinguish success from failure unambiguously. `probe` is a
/// lightweight reachability check used by the background health loop; the
/// default assumes reachable.
#[async_trait]
pub trait ToolConnector: Send + Sync + fmt::Debug {
    async fn execute(&self, tool_id: &ToolId, parameters: &Value, timeout: Duration)
        -> Result<Value>;

    async fn probe(&self, _tool_id: &ToolId) -> bool {
        true
    }
}

/// Immutable operational definition of one tool.
///
/// Owned exclusively by the registry after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    pub name: String,
    /// Opaque network target; the connector interprets it.
    pub endpoint: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl ToolDefinition {
    /// Definition with default policies. Callers override fields as needed.
    pub fn new(id: ToolId, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }

    /// Definition seeded from coordinator-level default policies. Callers
    /// override individual fields before registering.
    pub fn with_policies(
        id: ToolId,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        defaults: &DefaultPolicies,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            endpoint: endpoint.into(),
            timeout: defaults.timeout,
            retry: defaults.retry.clone(),
            circuit_breaker: defaults.circuit_breaker.clone(),
            bulkhead: defaults.bulkhead.clone(),
            health_check: defaults.health_check.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("tool name cannot be empty"));
        }
        if self.timeout.is_zero() {
            return Err(Error::validation("tool timeout must be non-zero"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::validation("failure_threshold must be at least 1"));
        }
        if self.bulkhead.max_concurrent_requests == 0 {
            return Err(Error::validation(
                "max_concurrent_requests must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RegisteredTool {
    definition: Arc<ToolDefinition>,
    connector: Arc<dyn ToolConnector>,
    probe_task: Option<ProbeHandle>,
}

/// In-memory tool registry: definitions plus the registered-handler table.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, RegisteredTool>>,
    tracker: Arc<Mutex<ToolHealthTracker>>,
}

impl ToolRegistry {
    pub fn new(tracker: Arc<Mutex<ToolHealthTracker>>) -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            tracker,
        }
    }

    /// Register a tool and its connector. When health checks are enabled,
    /// a cancellable probe loop starts at the declared interval (requires a
    /// tokio runtime).
    pub fn register(
        &self,
        definition: ToolDefinition,
        connector: Arc<dyn ToolConnector>,
    ) -> Result<()> {
        definition.validate()?;

        let mut tools = lock_unpoisoned(&self.tools);
        if tools.contains_key(definition.id.as_str()) {
            return Err(Error::validation(format!(
                "tool already registered: {}",
                definition.id
            )));
        }

        let definition = Arc::new(definition);
        let probe_task = if definition.health_check.enabled {
            Some(spawn_probe_loop(
                definition.clone(),
                connector.clone(),
                self.tracker.clone(),
            ))
        } else {
            None
        };

        lock_unpoisoned(&self.tracker).register_tool(definition.id.as_str());
        tracing::info!(tool = %definition.id, endpoint = %definition.endpoint, "tool registered");

        tools.insert(
            definition.id.as_str().to_string(),
            RegisteredTool {
                definition,
                connector,
                probe_task,
            },
        );
        Ok(())
    }

    /// Look up a tool's definition and connector.
    pub fn get(&self, tool_id: &ToolId) -> Option<(Arc<ToolDefinition>, Arc<dyn ToolConnector>)> {
        let tools = lock_unpoisoned(&self.tools);
        tools
            .get(tool_id.as_str())
            .map(|t| (t.definition.clone(), t.connector.clone()))
    }

    pub fn has_tool(&self, tool_id: &ToolId) -> bool {
        lock_unpoisoned(&self.tools).contains_key(tool_id.as_str())
    }

    /// Remove a tool, stopping its probe loop. Returns false if unknown.
    pub fn deregister(&self, tool_id: &ToolId) -> bool {
        let removed = lock_unpoisoned(&self.tools).remove(tool_id.as_str());
        match removed {
            Some(tool) => {
                if let Some(task) = &tool.probe_task {
                    task.stop();
                }
                lock_unpoisoned(&self.tracker).deregister_tool(tool_id.as_str());
                tracing::info!(tool = %tool_id, "tool deregistered");
                true
            }
            None => false,
        }
    }

    /// Stop all probe loops. Definitions remain queryable.
    pub fn shutdown(&self) {
        let mut tools = lock_unpoisoned(&self.tools);
        for tool in tools.values_mut() {
            if let Some(task) = tool.probe_task.take() {
                task.stop();
            }
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        let tools = lock_unpoisoned(&self.tools);
        let mut ids: Vec<String> = tools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.tools).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.tools).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct EchoConnector;

    #[async_trait]
    impl ToolConnector for EchoConnector {
        async fn execute(
            &self,
            _tool_id: &ToolId,
            parameters: &Value,
            _timeout: Duration,
        ) -> Result<Value> {
            Ok(parameters.clone())
        }
    }

    fn new_registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(Mutex::new(ToolHealthTracker::default())))
    }

    fn sample_definition(id: &str) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::must(id),
            "Document retrieval",
            "https://tools.internal/retrieval",
        )
    }

    #[test]
    fn test_register_and_get() {
        let registry = new_registry();
        registry
            .register(sample_definition("document_retrieval"), Arc::new(EchoConnector))
            .unwrap();

        assert!(registry.has_tool(&ToolId::must("document_retrieval")));
        assert_eq!(registry.len(), 1);

        let (definition, _connector) = registry.get(&ToolId::must("document_retrieval")).unwrap();
        assert_eq!(definition.name, "Document retrieval");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = new_registry();
        registry
            .register(sample_definition("checkout"), Arc::new(EchoConnector))
            .unwrap();
        let result = registry.register(sample_definition("checkout"), Arc::new(EchoConnector));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_bad_definitions() {
        let mut definition = sample_definition("checkout");
        definition.name = String::new();
        assert!(definition.validate().is_err());

        let mut definition = sample_definition("checkout");
        definition.timeout = Duration::ZERO;
        assert!(definition.validate().is_err());

        let mut definition = sample_definition("checkout");
        definition.circuit_breaker.failure_threshold = 0;
        assert!(definition.validate().is_err());

        let mut definition = sample_definition("checkout");
        definition.bulkhead.max_concurrent_requests = 0;
        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_deregister() {
        let registry = new_registry();
        registry
            .register(sample_definition("checkout"), Arc::new(EchoConnector))
            .unwrap();

        assert!(registry.deregister(&ToolId::must("checkout")));
        assert!(!registry.deregister(&ToolId::must("checkout")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_ids_sorted() {
        let registry = new_registry();
        registry
            .register(sample_definition("zeta"), Arc::new(EchoConnector))
            .unwrap();
        registry
            .register(sample_definition("alpha"), Arc::new(EchoConnector))
            .unwrap();
        assert_eq!(registry.list_ids(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_probe_loop_records_outcomes_and_stops() {
        #[derive(Debug)]
        struct FlakyProbe;

        #[async_trait]
        impl ToolConnector for FlakyProbe {
            async fn execute(
                &self,
                _tool_id: &ToolId,
                _parameters: &Value,
                _timeout: Duration,
            ) -> Result<Value> {
                Ok(Value::Null)
            }

            async fn probe(&self, _tool_id: &ToolId) -> bool {
                false
            }
        }

        let tracker = Arc::new(Mutex::new(ToolHealthTracker::default()));
        let registry = ToolRegistry::new(tracker.clone());

        let mut definition = sample_definition("assistant");
        definition.health_check = HealthCheckConfig {
            enabled: true,
            interval: Duration::from_millis(10),
        };
        registry.register(definition, Arc::new(FlakyProbe)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = lock_unpoisoned(&tracker).check_tool_health("assistant");
        assert_eq!(report.last_probe_healthy, Some(false));

        registry.shutdown();
    }
}
