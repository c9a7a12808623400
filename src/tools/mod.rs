//! Tool infrastructure — registry, connector contract, health tracking.
//!
//! The registry owns tool definitions and the connector handler table; the
//! health tracker owns sliding-window execution metrics and probe outcomes.

pub mod health;
pub mod registry;

pub use health::{
    HealthConfig, HealthStatus, HealthSummary, SystemHealthReport, ToolHealthReport,
    ToolHealthTracker,
};
pub use registry::{ToolConnector, ToolDefinition, ToolRegistry};
