//! Core types — configuration, errors, strongly-typed identifiers.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{
    BulkheadConfig, CircuitBreakerConfig, CoordinatorConfig, DefaultPolicies, HealthCheckConfig,
    ObservabilityConfig, RetryConfig,
};
pub use errors::{Error, Result};
pub use ids::{InvocationId, PlanId, StepId, TenantId, ToolId, UserId};
