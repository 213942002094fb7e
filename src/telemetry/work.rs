//! Work execution span helpers.

use tracing::Span;

use crate::model::{State, WorkId};

/// Start a span for one item's execution on a worker.
///
/// `work.state` is declared empty and filled by [`record_state_transition`].
pub fn start_work_span(worker: &str, work_id: &WorkId) -> Span {
    tracing::debug_span!(
        "work.execute",
        "work.id" = %work_id,
        "work.worker" = worker,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as a debug event.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.record("work.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::debug!(%from, %to, "state_transition");
    });
}
