//! Metrics instrumentation for probe-dns.
//!
//! All metrics are prefixed with `probe_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::error::ProbeError;

/// Record one resolution attempt.
pub fn record_resolution<T>(
    transport: &'static str,
    result: &Result<T, ProbeError>,
    duration: std::time::Duration,
) {
    let result_str = match result {
        Ok(_) => "success",
        Err(ProbeError::Cancelled(_)) => "cancelled",
        Err(ProbeError::ProtocolMalformed { .. }) => "malformed",
        Err(ProbeError::UpstreamStatus { .. }) => "upstream_status",
        Err(_) => "error",
    };

    counter!("probe_dns.resolution.count", "transport" => transport, "result" => result_str)
        .increment(1);
    histogram!("probe_dns.resolution.duration.seconds", "transport" => transport)
        .record(duration.as_secs_f64());
}

/// Record a cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("probe_dns.cache.lookup.count", "outcome" => outcome).increment(1);
}

/// Record a cache write.
pub fn record_cache_store() {
    counter!("probe_dns.cache.store.count").increment(1);
}

/// Why an actor evicted itself.
#[derive(Debug, Clone, Copy)]
pub enum EvictionReason {
    /// Commanded by the controller or an operator.
    Commanded,
    /// Live vantage point no longer matches Locked State.
    Drift,
    /// No registry row references the actor.
    Orphaned,
}

/// Record an actor eviction.
pub fn record_eviction(reason: EvictionReason) {
    let reason_str = match reason {
        EvictionReason::Commanded => "commanded",
        EvictionReason::Drift => "drift",
        EvictionReason::Orphaned => "orphaned",
    };

    counter!("probe_dns.actor.eviction.count", "reason" => reason_str).increment(1);
}

/// Record a self-check that could not reach a verdict.
pub fn record_inconclusive_check() {
    counter!("probe_dns.actor.check.inconclusive.count").increment(1);
}

/// Record the outcome of one stale-row teardown.
pub fn record_teardown(success: bool) {
    let result = if success { "success" } else { "error" };
    counter!("probe_dns.controller.teardown.count", "result" => result).increment(1);
}

/// Record the outcome of one missing-location creation sequence.
pub fn record_creation(success: bool, attempts: u32) {
    let result = if success { "success" } else { "error" };
    counter!("probe_dns.controller.creation.count", "result" => result).increment(1);
    histogram!("probe_dns.controller.creation.attempts").record(f64::from(attempts));
}

/// Record the shape of one reconciliation cycle.
pub fn record_cycle(desired: usize, registered: usize, stale: usize, missing: usize) {
    counter!("probe_dns.controller.cycle.count").increment(1);
    gauge!("probe_dns.controller.desired").set(desired as f64);
    gauge!("probe_dns.controller.registered").set(registered as f64);
    gauge!("probe_dns.controller.stale").set(stale as f64);
    gauge!("probe_dns.controller.missing").set(missing as f64);
}

/// Record a cycle abandoned before the diff could be computed.
pub fn record_cycle_failed() {
    counter!("probe_dns.controller.cycle.failed.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
