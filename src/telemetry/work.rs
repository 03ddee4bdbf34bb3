//! Work execution span helpers.
//!
//! Every dispatched task body runs inside a `work.execute` span so logs the
//! task emits are attributable to its work item.

use tracing::Span;

use crate::model::{State, WorkId};

/// Start a span for work item execution.
///
/// The `work.state` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_work_span(id: WorkId, limit: usize) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.id" = %id,
        "work.queue_limit" = limit,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Updates `work.state` and emits a debug event scoped to the span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("work.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
