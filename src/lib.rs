//! # Concierge Core - Resilient Multi-Tool Coordination
//!
//! Multi-tenant coordination layer for independently-failing remote tools:
//! - Per-operation circuit breaking with half-open recovery probes
//! - Per-tenant bulkheads (concurrency + queue admission control)
//! - Dependency-graph execution plans (parallel fan-out or topological walk)
//! - Partial-failure aggregation: one result entry per requested step
//! - Sliding-window health tracking fed by executions and background probes
//!
//! ## Architecture
//!
//! One `ToolCoordinator` instance owns all mutable state; the registries it
//! wires together are plain structs, not process-wide singletons:
//! ```text
//!   invoke / plan →  ┌─────────────────────────────────┐
//!                    │        ToolCoordinator          │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │  Tool   │ │ Circuit │        │
//!                    │  │Registry │ │ Breaker │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │ Tenant  │ │ Health  │        │
//!                    │  │Bulkheads│ │ Tracker │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod breaker;
pub mod bulkhead;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod plan;
pub mod tools;
pub mod types;

// Internal utilities
pub mod observability;
mod sync;

pub use breaker::{BreakerStats, CircuitState};
pub use bulkhead::BulkheadStats;
pub use coordinator::ToolCoordinator;
pub use events::{CoordinatorEvent, MetricsSink, NullSink, TracingSink};
pub use executor::{ToolInvocation, ToolResult};
pub use plan::{CoordinatedPlanResult, ExecutionPlan, PlanStep, StepOutcome};
pub use tools::{ToolConnector, ToolDefinition, ToolHealthReport};
pub use types::{CoordinatorConfig, Error, Result};
