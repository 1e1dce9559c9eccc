//! Metrics for affinity group reconciliation
//!
//! Instruments are registered against the global meter; they are no-ops until
//! telemetry installs an exporting meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("affinity"));

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `result`: ready, absent, warning, failed, unsupported, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("affinity_reconcile_duration_seconds")
        .with_description("Duration of cluster module reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of per-owner failures
///
/// Labels:
/// - `kind`: incompatible_owner, platform, timeout
pub static OWNER_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("affinity_owner_failures_total")
        .with_description("Total number of per-owner affinity group failures")
        .with_unit("{failures}")
        .build()
});

/// Counter of affinity groups removed because their owner disappeared
pub static ORPHANS_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("affinity_orphans_removed_total")
        .with_description("Total number of orphaned affinity groups removed")
        .with_unit("{groups}")
        .build()
});

/// Gauge of bindings recorded after the last pass of a cluster
///
/// Labels:
/// - `cluster`: namespace/name of the infrastructure cluster
pub static BINDINGS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("affinity_bindings")
        .with_description("Number of affinity group bindings per cluster")
        .with_unit("{bindings}")
        .build()
});

/// Record the duration of a finished pass
pub fn record_reconcile(result: &'static str, seconds: f64) {
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("result", result)]);
}

/// Record one per-owner failure
pub fn record_owner_failure(kind: &'static str) {
    OWNER_FAILURES.add(1, &[KeyValue::new("kind", kind)]);
}

/// Record one orphan removal attempt that succeeded
pub fn record_orphan_removed() {
    ORPHANS_REMOVED.add(1, &[]);
}

/// Record the binding count of a cluster
pub fn record_bindings(cluster: &str, count: usize) {
    BINDINGS.record(count as u64, &[KeyValue::new("cluster", cluster.to_string())]);
}
