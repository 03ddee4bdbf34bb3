//! Integration tests for telemetry initialization and span helpers.

use std::sync::Arc;

use workq::model::{State, WorkId};
use workq::{ManualExecutor, WorkQueue};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err if another test got there first; that is acceptable.
    let config = workq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workq-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = workq::telemetry::init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_transition() {
    let span = workq::telemetry::work::start_work_span(WorkId::new(), 4);
    workq::telemetry::work::record_state_transition(&span, State::Pending, State::Active);
    workq::telemetry::work::record_state_transition(&span, State::Active, State::Completed);
}

#[test]
fn metrics_are_noops_without_a_provider() {
    workq::telemetry::metrics::work_submitted().add(1, &[]);
    workq::telemetry::metrics::work_wait_ms().record(1.5, &[]);

    // Queue operations record metrics on every path; none of them may fail.
    let executor = Arc::new(ManualExecutor::new());
    let queue = WorkQueue::with_executor(1, executor.clone()).unwrap();
    queue.add_active_work_item(|| {});
    let pending = queue.add_active_work_item(|| {});
    pending.move_to_front();
    pending.cancel();
    executor.run_all();
    queue.validate();
}
