//! Integration tests for telemetry initialization and span helpers.

use workq::State;
use workq::WorkId;
use workq::telemetry::metrics::SchedulerMetrics;
use workq::telemetry::work::{record_state_transition, start_work_span};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init is allowed to fail.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "workq-test".to_string(),
        default_filter: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn work_span_creates_and_records_transition() {
    let id = WorkId::new();
    let span = start_work_span("consumer-0", &id);
    record_state_transition(&span, State::Queued, State::Running);
    record_state_transition(&span, State::Running, State::Completed);
}

#[test]
fn metrics_are_noops_without_a_provider() {
    let metrics = SchedulerMetrics::new();
    metrics.record_admitted(3);
    metrics.record_rejected(1);
    metrics.record_finished(State::Completed, 12.5);
    metrics.record_finished(State::Canceled, 0.0);
}
