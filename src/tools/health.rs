//! Tool health tracking and background probing.
//!
//! In-memory sliding-window execution metrics per tool, merged with the
//! latest background probe outcome. Probes inform status reporting only;
//! they never open the circuit breaker, so probe noise cannot starve
//! production traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitState;
use crate::sync::lock_unpoisoned;
use crate::tools::registry::{ToolConnector, ToolDefinition};

// =============================================================================
// Configuration
// =============================================================================

/// Health assessment thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Minimum success rate for HEALTHY status (default: 0.95).
    pub success_rate_healthy: f64,
    /// Minimum success rate for DEGRADED status (default: 0.80).
    pub success_rate_degraded: f64,
    /// Maximum avg latency (ms) for HEALTHY status (default: 2000).
    pub latency_healthy_ms: u64,
    /// Maximum avg latency (ms) for DEGRADED status (default: 5000).
    pub latency_degraded_ms: u64,
    /// Minimum calls before health assessment (default: 5).
    pub min_calls_for_assessment: usize,
    /// Sliding window size for health metrics (default: 100).
    pub window_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_rate_healthy: 0.95,
            success_rate_degraded: 0.80,
            latency_healthy_ms: 2000,
            latency_degraded_ms: 5000,
            min_calls_for_assessment: 5,
            window_size: 100,
        }
    }
}

/// Overall health of a tool or the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

// =============================================================================
// Execution record
// =============================================================================

/// Single tool execution record (in-memory, sliding window).
#[derive(Debug, Clone)]
struct ExecutionRecord {
    success: bool,
    latency_ms: u64,
    error_kind: Option<String>,
}

/// Sliding window metrics for a single tool.
#[derive(Debug)]
struct ToolMetrics {
    records: VecDeque<ExecutionRecord>,
    window_size: usize,
}

impl ToolMetrics {
    fn new(window_size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn record(&mut self, success: bool, latency_ms: u64, error_kind: Option<String>) {
        if self.records.len() >= self.window_size {
            self.records.pop_front();
        }
        self.records.push_back(ExecutionRecord {
            success,
            latency_ms,
            error_kind,
        });
    }

    fn total_calls(&self) -> usize {
        self.records.len()
    }

    fn error_count(&self) -> usize {
        self.records.iter().filter(|r| !r.success).count()
    }

    fn success_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        (total - self.error_count()) as f64 / total as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        let sum: u64 = self.records.iter().map(|r| r.latency_ms).sum();
        sum as f64 / total as f64
    }

    fn error_patterns(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in &self.records {
            if !record.success {
                let kind = record.error_kind.as_deref().unwrap_or("unknown").to_string();
                *counts.entry(kind).or_default() += 1;
            }
        }
        let mut patterns: Vec<(String, usize)> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1));
        patterns
    }
}

// =============================================================================
// Health reports
// =============================================================================

/// Health report for a single tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolHealthReport {
    pub tool_id: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_calls: usize,
    pub recent_errors: usize,
    /// Outcome of the latest background probe, if one has run.
    pub last_probe_healthy: Option<bool>,
    /// Filled in by the coordinator from the breaker registry.
    pub circuit_state: Option<CircuitState>,
    pub issues: Vec<String>,
}

/// System-wide health report.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub tool_reports: Vec<ToolHealthReport>,
    pub summary: HealthSummary,
}

/// Counts by health status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

// =============================================================================
// Health tracker
// =============================================================================

#[derive(Debug, Clone)]
struct ProbeOutcome {
    healthy: bool,
    at: DateTime<Utc>,
}

/// In-memory tool health tracker with sliding-window metrics.
#[derive(Debug)]
pub struct ToolHealthTracker {
    config: HealthConfig,
    metrics: HashMap<String, ToolMetrics>,
    probes: HashMap<String, ProbeOutcome>,
    /// Tools that were registered but may not have executed yet.
    registered_tools: Vec<String>,
}

impl ToolHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            metrics: HashMap::new(),
            probes: HashMap::new(),
            registered_tools: Vec::new(),
        }
    }

    /// Track a registered tool so it appears in system reports before its
    /// first execution.
    pub fn register_tool(&mut self, tool_id: &str) {
        if !self.registered_tools.iter().any(|t| t == tool_id) {
            self.registered_tools.push(tool_id.to_string());
        }
    }

    pub fn deregister_tool(&mut self, tool_id: &str) {
        self.registered_tools.retain(|t| t != tool_id);
        self.metrics.remove(tool_id);
        self.probes.remove(tool_id);
    }

    /// Record a tool execution outcome.
    pub fn record_execution(
        &mut self,
        tool_id: &str,
        success: bool,
        latency_ms: u64,
        error_kind: Option<String>,
    ) {
        let metrics = self
            .metrics
            .entry(tool_id.to_string())
            .or_insert_with(|| ToolMetrics::new(self.config.window_size));
        metrics.record(success, latency_ms, error_kind);
    }

    /// Record a background probe outcome.
    pub fn record_probe(&mut self, tool_id: &str, healthy: bool) {
        self.probes.insert(
            tool_id.to_string(),
            ProbeOutcome {
                healthy,
                at: Utc::now(),
            },
        );
    }

    /// Check health of a single tool.
    pub fn check_tool_health(&self, tool_id: &str) -> ToolHealthReport {
        let probe = self.probes.get(tool_id);
        let last_probe_healthy = probe.map(|p| p.healthy);

        let Some(m) = self.metrics.get(tool_id) else {
            let mut issues = vec!["No execution history".to_string()];
            if let Some(p) = probe {
                if !p.healthy {
                    issues.push(format!("Last probe at {} unhealthy", p.at));
                }
            }
            return ToolHealthReport {
                tool_id: tool_id.to_string(),
                status: HealthStatus::Unknown,
                success_rate: 0.0,
                avg_latency_ms: 0.0,
                total_calls: 0,
                recent_errors: 0,
                last_probe_healthy,
                circuit_state: None,
                issues,
            };
        };

        let total = m.total_calls();
        if total < self.config.min_calls_for_assessment {
            return ToolHealthReport {
                tool_id: tool_id.to_string(),
                status: HealthStatus::Unknown,
                success_rate: m.success_rate(),
                avg_latency_ms: m.avg_latency_ms(),
                total_calls: total,
                recent_errors: m.error_count(),
                last_probe_healthy,
                circuit_state: None,
                issues: vec![format!(
                    "Insufficient data ({}/{})",
                    total, self.config.min_calls_for_assessment
                )],
            };
        }

        let success_rate = m.success_rate();
        let avg_latency = m.avg_latency_ms();

        // Worst-of-two: success rate status vs latency status.
        let rate_status = if success_rate >= self.config.success_rate_healthy {
            HealthStatus::Healthy
        } else if success_rate >= self.config.success_rate_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        let latency_status = if avg_latency <= self.config.latency_healthy_ms as f64 {
            HealthStatus::Healthy
        } else if avg_latency <= self.config.latency_degraded_ms as f64 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        let mut status = worse_status(rate_status, latency_status);

        let mut issues = Vec::new();
        if success_rate < self.config.success_rate_healthy {
            issues.push(format!(
                "Success rate {:.1}% below {:.0}% threshold",
                success_rate * 100.0,
                self.config.success_rate_healthy * 100.0,
            ));
        }
        if avg_latency > self.config.latency_healthy_ms as f64 {
            issues.push(format!(
                "Avg latency {:.0}ms exceeds {}ms threshold",
                avg_latency, self.config.latency_healthy_ms,
            ));
        }
        if last_probe_healthy == Some(false) {
            issues.push("Latest health probe failed".to_string());
            status = worse_status(status, HealthStatus::Degraded);
        }

        ToolHealthReport {
            tool_id: tool_id.to_string(),
            status,
            success_rate,
            avg_latency_ms: avg_latency,
            total_calls: total,
            recent_errors: m.error_count(),
            last_probe_healthy,
            circuit_state: None,
            issues,
        }
    }

    /// Check health of all tools (registered + executed).
    pub fn check_system_health(&self) -> SystemHealthReport {
        let mut all_tools: Vec<String> = self.registered_tools.clone();
        for name in self.metrics.keys() {
            if !all_tools.contains(name) {
                all_tools.push(name.clone());
            }
        }
        all_tools.sort();

        let tool_reports: Vec<ToolHealthReport> = all_tools
            .iter()
            .map(|name| self.check_tool_health(name))
            .collect();

        let mut summary = HealthSummary::default();
        for report in &tool_reports {
            match report.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        // System status = worst of all tool statuses.
        let status = if summary.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if summary.degraded > 0 {
            HealthStatus::Degraded
        } else if summary.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };

        SystemHealthReport {
            status,
            tool_reports,
            summary,
        }
    }

    /// Get error patterns for a tool (kind, count), most frequent first.
    pub fn get_error_patterns(&self, tool_id: &str) -> Vec<(String, usize)> {
        self.metrics
            .get(tool_id)
            .map(|m| m.error_patterns())
            .unwrap_or_default()
    }

    /// Number of tools with execution history.
    pub fn tool_count(&self) -> usize {
        self.metrics.len()
    }
}

impl Default for ToolHealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

fn worse_status(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    let rank = |s: HealthStatus| -> u8 {
        match s {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Unknown => 3,
        }
    };
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

// =============================================================================
// Probe loop
// =============================================================================

/// Handle to one tool's background probe loop.
#[derive(Debug)]
pub(crate) struct ProbeHandle {
    token: CancellationToken,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl ProbeHandle {
    pub(crate) fn stop(&self) {
        self.token.cancel();
    }
}

/// Spawn a cancellable probe loop for one tool at its declared interval.
///
/// Probe outcomes feed the health tracker only; a failing probe is logged,
/// never fatal, and never touches the breaker.
pub(crate) fn spawn_probe_loop(
    definition: Arc<ToolDefinition>,
    connector: Arc<dyn ToolConnector>,
    tracker: Arc<Mutex<ToolHealthTracker>>,
) -> ProbeHandle {
    let token = CancellationToken::new();
    let child = token.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(definition.health_check.interval.max(MIN_PROBE_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = child.cancelled() => {
                    tracing::debug!(tool = %definition.id, "probe loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let healthy = connector.probe(&definition.id).await;
                    if !healthy {
                        tracing::warn!(tool = %definition.id, "health probe failed");
                    }
                    lock_unpoisoned(&tracker).record_probe(definition.id.as_str(), healthy);
                }
            }
        }
    });

    ProbeHandle { token, handle }
}

/// Floor for misconfigured probe intervals (zero would spin the loop).
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Tests
// =============================================================================
