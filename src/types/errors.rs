//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. The taxonomy distinguishes errors that
//! reached the remote dependency (counted against the circuit breaker) from
//! admission and configuration errors (never counted).

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the coordination layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Tool id has no registered definition (config error, not a breaker failure).
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tenant bulkhead rejected admission (not a breaker failure).
    #[error("bulkhead saturated: {0}")]
    BulkheadSaturated(String),

    /// The remote tool call itself failed (counted against the breaker).
    #[error("remote call failed: {0}")]
    RemoteCallFailed(String),

    /// Call exceeded its timeout (counted against the breaker).
    #[error("timeout: {0}")]
    Timeout(String),

    /// A plan step's declared dependency did not complete. The display
    /// text is the step-skip reason callers see on the synthesized result.
    #[error("Dependencies not met")]
    DependenciesNotMet,

    /// The dependency graph of a sequential plan contains a cycle.
    #[error("cyclic plan: {0}")]
    CyclicPlan(String),

    /// Structurally invalid input (empty ids, duplicate steps, unknown dependencies).
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error reached the remote dependency and should count
    /// toward circuit-breaker failure thresholds.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Error::RemoteCallFailed(_) | Error::Timeout(_))
    }

    /// Short stable kind name for health tracking and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ToolNotFound(_) => "ToolNotFound",
            Error::BulkheadSaturated(_) => "BulkheadSaturated",
            Error::RemoteCallFailed(_) => "RemoteCallFailed",
            Error::Timeout(_) => "Timeout",
            Error::DependenciesNotMet => "DependenciesNotMet",
            Error::CyclicPlan(_) => "CyclicPlan",
            Error::Validation(_) => "Validation",
            Error::Internal(_) => "Internal",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn tool_not_found(msg: impl Into<String>) -> Self {
        Self::ToolNotFound(msg.into())
    }

    pub fn bulkhead_saturated(msg: impl Into<String>) -> Self {
        Self::BulkheadSaturated(msg.into())
    }

    pub fn remote_call_failed(msg: impl Into<String>) -> Self {
        Self::RemoteCallFailed(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cyclic_plan(msg: impl Into<String>) -> Self {
        Self::CyclicPlan(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
