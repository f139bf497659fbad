//! Work execution span helpers.
//!
//! Provides span creation and outcome recording for leased items flowing
//! through a worker.

use tracing::Span;

use crate::model::{Lease, SessionId};

/// Start a span for handling one leased item.
///
/// The `work.result` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_work_span(queue: &str, session: &SessionId, lease: &Lease) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.queue" = queue,
        "work.session" = %session,
        "work.id" = %lease.id(),
        "work.deliveries" = lease.item.deliveries,
        "work.result" = tracing::field::Empty,
    )
}

/// Record how handling ended on the given span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_outcome(span: &Span, result: &str, duration_ms: u64) {
    span.record("work.result", result);
    span.in_scope(|| {
        tracing::info!(result = result, duration_ms, "work_finished");
    });
}
