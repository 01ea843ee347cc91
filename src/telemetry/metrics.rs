//! Metric instrument factories for the forwarder.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"artifact-forwarder"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for forwarder instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("artifact-forwarder")
}

/// Counter: work items claimed from the backlog.
/// Labels: `worker`.
pub fn artifacts_claimed() -> Counter<u64> {
    meter()
        .u64_counter("forwarder.artifacts.claimed")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: outcomes recorded for claimed items.
/// Labels: `outcome` ("forwarded" | "duplicate" | "dead" | "retry").
pub fn artifact_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("forwarder.artifacts.outcomes")
        .with_description("Number of outcomes recorded, by kind")
        .build()
}

/// Histogram: time spent in a submission round trip.
/// Labels: `result` ("ok" | "error").
pub fn submission_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("forwarder.submission.duration_ms")
        .with_description("Analysis engine submission duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: dedup lookups that failed and were treated as "not a duplicate".
pub fn dedup_check_failures() -> Counter<u64> {
    meter()
        .u64_counter("forwarder.dedup.check_failures")
        .with_description("Dedup lookups that failed")
        .build()
}

/// Counter: artifacts whose content hash fell back to the logged hash or unknown.
pub fn hash_fallbacks() -> Counter<u64> {
    meter()
        .u64_counter("forwarder.hash.fallbacks")
        .with_description("Content hashes that could not be computed from disk")
        .build()
}
