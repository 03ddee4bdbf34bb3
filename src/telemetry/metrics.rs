//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: work items submitted.
/// Labels: `placement` ("back" | "front"), `dispatch` ("immediate" | "queued").
pub fn work_submitted() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.submitted")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: pending items promoted to the head of the queue.
pub fn work_promoted() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.promoted")
        .with_description("Number of pending work items moved to the front")
        .build()
}

/// Counter: task bodies that panicked.
pub fn work_panicked() -> Counter<u64> {
    meter()
        .u64_counter("workq.work.panicked")
        .with_description("Number of work items whose task panicked")
        .build()
}

/// Histogram: time spent pending before dispatch, in milliseconds.
pub fn work_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.work.wait_ms")
        .with_description("Time from submission to dispatch")
        .with_unit("ms")
        .build()
}
