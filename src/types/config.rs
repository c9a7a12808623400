//! Configuration structures.
//!
//! Per-tool operational policies (timeout, retry, breaker, bulkhead, health
//! check) plus the coordinator-level defaults that seed definitions built
//! through `ToolCoordinator::define_tool`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordinatorConfig {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Policies seeding definitions built through the coordinator.
    #[serde(default)]
    pub defaults: DefaultPolicies,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default operational policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPolicies {
    /// Default per-invocation timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Default retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Default circuit breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default per-tenant bulkhead limits.
    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    /// Default health check behavior.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

impl Default for DefaultPolicies {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Retry policy for a single invocation.
///
/// Retries happen inside the invocation executor, below the circuit breaker:
/// one exhausted attempt set counts as one breaker failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first (0 = no retries).
    pub max_retries: u32,

    /// Initial delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
    }
}

/// Circuit breaker thresholds for one operation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long an open circuit waits before admitting a trial call.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Failures older than this window do not accumulate toward the
    /// threshold; the count restarts at the next failure.
    #[serde(with = "humantime_serde")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(300),
        }
    }
}

/// Per-tenant bulkhead limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Concurrent in-flight requests allowed per tenant.
    pub max_concurrent_requests: u32,

    /// Requests admitted beyond the concurrency cap, waiting for a slot.
    pub queue_size: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            queue_size: 20,
        }
    }
}

/// Health check loop behavior for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether a background probe loop runs for this tool.
    pub enabled: bool,

    /// Probe interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
        }
    }
}
