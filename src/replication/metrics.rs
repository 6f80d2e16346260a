//! Prometheus metrics for the replica manager.
//!
//! Metrics cover:
//! - Partition ownership (hosted partitions, leader count, under-replicated)
//! - ISR churn (expands, shrinks, pending propagation)
//! - Request failures (produce, fetch)
//! - Purgatory depth (pending delayed produces and fetches)
//!
//! The metric sink is a value injected into the manager rather than ambient
//! state, so tests can assert on a private registry.
//!
//! # Safety
//!
//! All metrics register against a registry with the `replicant` prefix to
//! avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully: if a metric fails to
//! register, an unregistered fallback instance is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry};
use tracing::warn;

/// Shared Prometheus registry for replica manager metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("replicant".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("static gauge options are valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "failed to register gauge, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static counter options are valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register counter, using unregistered fallback");
    }
    counter
}

/// Metric sink injected into the replica manager.
#[derive(Debug, Clone)]
pub struct ReplicaMetrics {
    /// Partitions hosted on this broker.
    pub partition_count: IntGauge,
    /// Partitions this broker currently leads.
    pub leader_count: IntGauge,
    /// Leader partitions whose ISR is smaller than the assigned set.
    pub under_replicated_partitions: IntGauge,
    /// ISR expansions performed.
    pub isr_expands: IntCounter,
    /// ISR shrinks performed.
    pub isr_shrinks: IntCounter,
    /// ISR changes awaiting propagation to the coordination store.
    pub isr_changes_pending: IntGauge,
    /// Produce requests that failed for at least one partition.
    pub failed_produce_requests: IntCounter,
    /// Fetch requests that failed for at least one partition.
    pub failed_fetch_requests: IntCounter,
    /// Delayed produces currently watched in the produce purgatory.
    pub delayed_produce_pending: IntGauge,
    /// Delayed fetches currently watched in the fetch purgatory.
    pub delayed_fetch_pending: IntGauge,
    /// Delayed operations that hit their deadline.
    pub delayed_operation_timeouts: IntCounter,
}

impl ReplicaMetrics {
    /// Register all metrics against the given registry.
    pub fn new(registry: &Registry) -> Self {
        Self {
            partition_count: register_int_gauge_safe(
                registry,
                "partition_count",
                "Partitions hosted on this broker",
            ),
            leader_count: register_int_gauge_safe(
                registry,
                "leader_count",
                "Partitions this broker currently leads",
            ),
            under_replicated_partitions: register_int_gauge_safe(
                registry,
                "under_replicated_partitions",
                "Leader partitions with ISR smaller than the assigned set",
            ),
            isr_expands: register_int_counter_safe(
                registry,
                "isr_expands_total",
                "ISR expansions performed",
            ),
            isr_shrinks: register_int_counter_safe(
                registry,
                "isr_shrinks_total",
                "ISR shrinks performed",
            ),
            isr_changes_pending: register_int_gauge_safe(
                registry,
                "isr_changes_pending",
                "ISR changes awaiting propagation",
            ),
            failed_produce_requests: register_int_counter_safe(
                registry,
                "failed_produce_requests_total",
                "Produce requests that failed for at least one partition",
            ),
            failed_fetch_requests: register_int_counter_safe(
                registry,
                "failed_fetch_requests_total",
                "Fetch requests that failed for at least one partition",
            ),
            delayed_produce_pending: register_int_gauge_safe(
                registry,
                "delayed_produce_pending",
                "Delayed produces watched in the produce purgatory",
            ),
            delayed_fetch_pending: register_int_gauge_safe(
                registry,
                "delayed_fetch_pending",
                "Delayed fetches watched in the fetch purgatory",
            ),
            delayed_operation_timeouts: register_int_counter_safe(
                registry,
                "delayed_operation_timeouts_total",
                "Delayed operations that hit their deadline",
            ),
        }
    }

    /// Metrics registered against the crate-wide `REGISTRY`.
    pub fn shared() -> Self {
        Self::new(&REGISTRY)
    }

    /// Metrics against a throwaway registry, for tests.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new())
    }
}
