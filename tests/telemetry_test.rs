//! Integration tests for telemetry initialization and span helpers.

use artifact_forwarder::model::WorkId;
use artifact_forwarder::telemetry::{TelemetryConfig, init_telemetry, metrics, work};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = init_telemetry(TelemetryConfig::new(None, "debug"));
}

#[test]
fn bad_default_filter_falls_back() {
    let _guard = init_telemetry(TelemetryConfig::new(None, "not a [valid filter"));
}

#[test]
fn config_carries_worker_identity() {
    let config = TelemetryConfig::new(Some("http://localhost:4317".into()), "info")
        .instance_id("honeynode-3-4242");
    assert_eq!(config.service_name, "artifact-forwarder");
    assert_eq!(config.instance_id.as_deref(), Some("honeynode-3-4242"));
    assert!(TelemetryConfig::new(None, "info").instance_id.is_none());
}

#[test]
fn item_span_creates_and_records_transition() {
    let span = work::start_item_span("worker-1", WorkId(17), 2);
    work::record_state_transition(&span, "claimed", "forwarded", None);
    work::record_state_transition(&span, "claimed", "pending", Some("engine returned HTTP 503"));
    span.record("work.outcome", "retry");
}

#[test]
fn instruments_accept_measurements_without_provider() {
    metrics::artifacts_claimed().add(1, &[KeyValue::new("worker", "w1")]);
    metrics::artifact_outcomes().add(1, &[KeyValue::new("outcome", "duplicate")]);
    metrics::submission_duration_ms().record(12.5, &[KeyValue::new("result", "ok")]);
    metrics::dedup_check_failures().add(1, &[]);
    metrics::hash_fallbacks().add(1, &[]);
}
