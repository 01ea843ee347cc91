//! Per-item span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the pipeline.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for processing one claimed item.
///
/// The `work.outcome` field is declared empty and filled in once the outcome
/// is recorded.
pub fn start_item_span(worker: &str, id: WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "artifact.process",
        "work.id" = %id,
        "worker.id" = worker,
        "work.attempt" = attempt,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str, reason: Option<&str>) {
    span.in_scope(|| match reason {
        Some(reason) => tracing::info!(from, to, reason, "state_transition"),
        None => tracing::info!(from, to, "state_transition"),
    });
}
