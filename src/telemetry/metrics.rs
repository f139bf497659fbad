//! Metric instrument factories for leaseq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"leaseq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for leaseq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: client-level queue operations.
/// Labels: `queue`, `operation` ("enqueue" | "lease" | "lease_empty" |
/// "lease_timeout" | "complete" | "complete_expired").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: expired leases returned to pending.
/// Labels: `queue`.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.lease.reclaimed")
        .with_description("Number of expired leases returned to the queue")
        .build()
}

/// Histogram: time from calling lease to receiving an item, in milliseconds.
/// Labels: `queue`.
pub fn lease_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.lease.wait_ms")
        .with_description("Time spent waiting for a lease")
        .with_unit("ms")
        .build()
}

/// Histogram: handler duration per item in milliseconds.
/// Labels: `queue`, `result` ("completed" | "expired" | "failed").
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.work.duration_ms")
        .with_description("Work item handling duration in milliseconds")
        .with_unit("ms")
        .build()
}
