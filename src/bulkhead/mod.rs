//! Per-tenant bulkhead admission control.
//!
//! Bounds each tenant's concurrent plus queued work so one overloaded tenant
//! cannot starve others sharing the coordinator. Admission is checked and
//! reserved before the circuit breaker and before any network call, so
//! saturation fails fast without consuming breaker failure budget.
//!
//! Tenant state is created lazily on first admission and retained for the
//! process lifetime.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use crate::sync::lock_unpoisoned;
use crate::types::{BulkheadConfig, Error, Result, TenantId};

/// Rolling latency samples kept per tenant.
const LATENCY_SAMPLE_WINDOW: usize = 100;

/// Mutable per-tenant counters. Mutated only under the registry mutex, in
/// short read-modify-write sections.
#[derive(Debug)]
struct TenantState {
    active_requests: u32,
    queued_requests: u32,
    total_requests: u64,
    failed_requests: u64,
    latency_samples: VecDeque<u64>,
    last_activity: DateTime<Utc>,
}

impl TenantState {
    fn new() -> Self {
        Self {
            active_requests: 0,
            queued_requests: 0,
            total_requests: 0,
            failed_requests: 0,
            latency_samples: VecDeque::with_capacity(LATENCY_SAMPLE_WINDOW),
            last_activity: Utc::now(),
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.latency_samples.iter().sum();
        sum as f64 / self.latency_samples.len() as f64
    }
}

/// Read-only snapshot of one tenant's bulkhead.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    pub active_requests: u32,
    pub queued_requests: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl BulkheadStats {
    fn empty() -> Self {
        Self {
            active_requests: 0,
            queued_requests: 0,
            total_requests: 0,
            failed_requests: 0,
            average_latency_ms: 0.0,
            last_activity: None,
        }
    }
}

/// Per-tenant bulkhead registry.
#[derive(Debug, Default)]
pub struct TenantBulkheads {
    tenants: Mutex<HashMap<String, TenantState>>,
}

impl TenantBulkheads {
    pub fn new() -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// True if the tenant has an in-flight slot or queue capacity left.
    pub fn can_accept(&self, tenant: &TenantId, config: &BulkheadConfig) -> bool {
        let tenants = lock_unpoisoned(&self.tenants);
        match tenants.get(tenant.as_str()) {
            Some(state) => {
                state.active_requests < config.max_concurrent_requests
                    || state.queued_requests < config.queue_size
            }
            None => true,
        }
    }

    /// Check capacity and reserve a slot in one atomic step.
    ///
    /// Takes the concurrency slot when available, the queue slot otherwise.
    /// Both saturated is an outright rejection: the distinct
    /// `BulkheadSaturated` kind, never conflated with a remote failure.
    /// The returned permit releases the slot when dropped, so cancellation
    /// of the guarded call cannot leak the admission.
    pub fn try_acquire(
        &self,
        tenant: &TenantId,
        config: &BulkheadConfig,
    ) -> Result<BulkheadPermit<'_>> {
        let mut tenants = lock_unpoisoned(&self.tenants);
        let state = tenants
            .entry(tenant.as_str().to_string())
            .or_insert_with(TenantState::new);

        if state.active_requests < config.max_concurrent_requests {
            state.active_requests += 1;
        } else if state.queued_requests < config.queue_size {
            state.queued_requests += 1;
        } else {
            tracing::warn!(
                tenant = %tenant,
                active = state.active_requests,
                queued = state.queued_requests,
                "bulkhead saturated, rejecting admission"
            );
            return Err(Error::bulkhead_saturated(format!(
                "tenant {} at capacity ({} active, {} queued)",
                tenant, state.active_requests, state.queued_requests
            )));
        }

        state.total_requests += 1;
        state.last_activity = Utc::now();
        Ok(BulkheadPermit {
            bulkheads: self,
            tenant: tenant.clone(),
            started: Instant::now(),
            success: false,
            latency_ms: None,
        })
    }

    /// Release the slot reserved by `try_acquire`. Called exactly once per
    /// acquisition, from the permit's `Drop`.
    ///
    /// Queued slots drain preferentially; failures bump `failed_requests`.
    fn release(&self, tenant: &TenantId, success: bool, latency_ms: u64) {
        let mut tenants = lock_unpoisoned(&self.tenants);
        let Some(state) = tenants.get_mut(tenant.as_str()) else {
            tracing::error!(tenant = %tenant, "release for unknown tenant bulkhead");
            return;
        };

        if state.queued_requests > 0 {
            state.queued_requests -= 1;
        } else if state.active_requests > 0 {
            state.active_requests -= 1;
        } else {
            tracing::error!(tenant = %tenant, "bulkhead release without matching acquire");
        }

        if !success {
            state.failed_requests += 1;
        }

        if state.latency_samples.len() >= LATENCY_SAMPLE_WINDOW {
            state.latency_samples.pop_front();
        }
        state.latency_samples.push_back(latency_ms);
        state.last_activity = Utc::now();
    }

    /// Snapshot for one tenant. Unseen tenants report zeroed stats.
    pub fn stats(&self, tenant: &TenantId) -> BulkheadStats {
        let tenants = lock_unpoisoned(&self.tenants);
        match tenants.get(tenant.as_str()) {
            Some(state) => BulkheadStats {
                active_requests: state.active_requests,
                queued_requests: state.queued_requests,
                total_requests: state.total_requests,
                failed_requests: state.failed_requests,
                average_latency_ms: state.average_latency_ms(),
                last_activity: Some(state.last_activity),
            },
            None => BulkheadStats::empty(),
        }
    }

    /// Number of tenants with tracked state.
    pub fn tenant_count(&self) -> usize {
        lock_unpoisoned(&self.tenants).len()
    }
}

/// Admission slot held for the duration of one guarded call.
///
/// Releases on drop, so a caller dropping the guarded future mid-await
/// still returns the slot. A plain drop counts as a failure with
/// wall-clock latency; `complete` records the real outcome instead.
#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    bulkheads: &'a TenantBulkheads,
    tenant: TenantId,
    started: Instant,
    success: bool,
    latency_ms: Option<u64>,
}

impl BulkheadPermit<'_> {
    /// Record the guarded call's outcome and release the slot.
    pub fn complete(mut self, success: bool, latency_ms: u64) {
        self.success = success;
        self.latency_ms = Some(latency_ms);
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        let latency_ms = self
            .latency_ms
            .unwrap_or_else(|| self.started.elapsed().as_millis() as u64);
        self.bulkheads.release(&self.tenant, self.success, latency_ms);
    }
}
