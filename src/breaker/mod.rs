//! Per-operation-key circuit breaking.
//!
//! One breaker record per operation key (the executor derives the key from
//! the tool id, so failure accounting accumulates across calls — key
//! stability is a correctness invariant, not a convenience). Records are
//! created lazily on first use and retained for the process lifetime.
//!
//! The breaker decides reachability only. It never retries; retries belong
//! to the invocation executor below it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use crate::sync::lock_unpoisoned;
use crate::types::{CircuitBreakerConfig, Result};

/// Breaker state for one operation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures accumulate.
    Closed,
    /// Calls are short-circuited to the fallback until the reset timeout elapses.
    Open,
    /// Exactly one trial call probes recovery.
    HalfOpen,
}

/// Mutable per-key record. All transitions happen under the registry mutex
/// as a single read-modify-write; the lock is never held across an await.
#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure: Option<DateTime<Utc>>,
    /// Guards the HALF_OPEN single-probe invariant: concurrent callers that
    /// arrive while a probe is in flight take the fallback.
    probe_in_flight: bool,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            probe_in_flight: false,
        }
    }
}

/// Read-only snapshot of one breaker record.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

/// How a guarded call produced its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerOutcome<T> {
    /// The real operation ran and succeeded.
    Executed(T),
    /// The circuit was open (or a probe was already in flight); the
    /// caller-supplied fallback produced the value.
    Fallback(T),
}

impl<T> BreakerOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, BreakerOutcome::Fallback(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            BreakerOutcome::Executed(v) | BreakerOutcome::Fallback(v) => v,
        }
    }
}

/// Admission decision for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Circuit closed: attempt the operation.
    Attempt,
    /// Circuit half-open: attempt the single trial call.
    Probe,
    /// Circuit open (or probe already in flight): invoke the fallback.
    ShortCircuit,
}

/// Keyed circuit breaker registry.
///
/// Heterogeneous policies are supported by passing the config per call, so
/// one registry serves every tool without separate breaker instances.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` guarded by the breaker record for `key`.
    ///
    /// Open circuit: `operation` is not attempted and `fallback` runs
    /// instead; a fallback error propagates to the caller unmodified.
    /// Operation errors are recorded as breaker failures (when they count —
    /// see [`crate::types::Error::counts_against_breaker`]) and returned
    /// unmodified.
    pub async fn call_with_breaker<T, Op, Fb, OpFut, FbFut>(
        &self,
        key: &str,
        config: &CircuitBreakerConfig,
        operation: Op,
        fallback: Fb,
    ) -> Result<BreakerOutcome<T>>
    where
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        let admission = {
            let mut records = lock_unpoisoned(&self.records);
            let record = records
                .entry(key.to_string())
                .or_insert_with(BreakerRecord::new);
            admit(record, config, Utc::now())
        };

        match admission {
            Admission::ShortCircuit => {
                tracing::debug!(key, "circuit open, invoking fallback");
                fallback().await.map(BreakerOutcome::Fallback)
            }
            Admission::Attempt | Admission::Probe => {
                let was_probe = admission == Admission::Probe;
                // A probe dropped mid-flight (caller cancellation) must not
                // wedge the key in HALF_OPEN; the guard frees the probe slot
                // unless the operation ran to completion.
                let mut probe_guard = was_probe.then(|| ProbeGuard {
                    breaker: self,
                    key,
                    armed: true,
                });
                let attempt = operation().await;
                if let Some(guard) = probe_guard.as_mut() {
                    guard.armed = false;
                }
                match attempt {
                    Ok(value) => {
                        let mut records = lock_unpoisoned(&self.records);
                        if let Some(record) = records.get_mut(key) {
                            record_success(record, was_probe);
                            if was_probe {
                                tracing::info!(key, "probe succeeded, circuit closed");
                            }
                        }
                        Ok(BreakerOutcome::Executed(value))
                    }
                    Err(err) => {
                        let mut records = lock_unpoisoned(&self.records);
                        if let Some(record) = records.get_mut(key) {
                            if err.counts_against_breaker() {
                                record_failure(record, was_probe, config, Utc::now());
                                if record.state == CircuitState::Open {
                                    tracing::warn!(
                                        key,
                                        failures = record.failure_count,
                                        "circuit opened"
                                    );
                                }
                            } else if was_probe {
                                // Non-remote error: the probe slot is freed
                                // without consuming the trial.
                                record.probe_in_flight = false;
                            }
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Read-only snapshot for a key. None if the key has never been seen.
    pub fn stats(&self, key: &str) -> Option<BreakerStats> {
        let records = lock_unpoisoned(&self.records);
        records.get(key).map(|r| BreakerStats {
            state: r.state,
            failure_count: r.failure_count,
            success_count: r.success_count,
            last_failure: r.last_failure,
        })
    }

    /// Current state for a key, if seen.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        lock_unpoisoned(&self.records).get(key).map(|r| r.state)
    }

    /// Forcibly return a key to CLOSED with zeroed counters.
    ///
    /// Administrative escape hatch for manual recovery and tests.
    pub fn reset(&self, key: &str) {
        let mut records = lock_unpoisoned(&self.records);
        if let Some(record) = records.get_mut(key) {
            *record = BreakerRecord::new();
        }
    }

    /// Number of tracked operation keys.
    pub fn key_count(&self) -> usize {
        lock_unpoisoned(&self.records).len()
    }
}

/// Frees a reserved probe slot if the probe future is dropped before the
/// operation completes, so the key cannot stay HALF_OPEN with a phantom
/// probe in flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    key: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut records = lock_unpoisoned(&self.breaker.records);
        if let Some(record) = records.get_mut(self.key) {
            if record.state == CircuitState::HalfOpen {
                record.probe_in_flight = false;
            }
        }
    }
}

/// Decide admission and apply any timeout-driven transition. Single atomic
/// read-modify-write under the registry lock.
fn admit(record: &mut BreakerRecord, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Admission {
    match record.state {
        CircuitState::Closed => Admission::Attempt,
        CircuitState::Open => {
            let reset_elapsed = match record.last_failure {
                Some(last) => {
                    now.signed_duration_since(last).to_std().unwrap_or_default()
                        >= config.reset_timeout
                }
                // Open without a failure timestamp cannot happen through
                // normal transitions; allow the probe rather than wedge.
                None => true,
            };
            if reset_elapsed {
                record.state = CircuitState::HalfOpen;
                record.probe_in_flight = true;
                Admission::Probe
            } else {
                Admission::ShortCircuit
            }
        }
        CircuitState::HalfOpen => {
            if record.probe_in_flight {
                Admission::ShortCircuit
            } else {
                record.probe_in_flight = true;
                Admission::Probe
            }
        }
    }
}

fn record_success(record: &mut BreakerRecord, was_probe: bool) {
    if was_probe {
        *record = BreakerRecord::new();
    }
    record.failure_count = 0;
    record.success_count += 1;
}

fn record_failure(
    record: &mut BreakerRecord,
    was_probe: bool,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) {
    if was_probe {
        record.state = CircuitState::Open;
        record.probe_in_flight = false;
        record.last_failure = Some(now);
        return;
    }

    // Failures outside the monitoring window restart the count.
    if let Some(last) = record.last_failure {
        let since_last = now.signed_duration_since(last).to_std().unwrap_or_default();
        if since_last > config.monitoring_window {
            record.failure_count = 0;
        }
    }

    record.failure_count += 1;
    record.last_failure = Some(now);
    if record.failure_count >= config.failure_threshold {
        record.state = CircuitState::Open;
    }
}
