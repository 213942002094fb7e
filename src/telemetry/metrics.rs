//! Scheduler metric instruments.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`,
//! so every instrument is a no-op until a provider is installed.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::State;

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Instruments owned by one scheduler, built once at construction.
#[derive(Clone)]
pub struct SchedulerMetrics {
    admitted: Counter<u64>,
    finished: Counter<u64>,
    duration_ms: Histogram<f64>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        let meter = meter();
        Self {
            // Labels: `result` ("ok" | "rejected").
            admitted: meter
                .u64_counter("workq.work.admitted")
                .with_description("Work items offered to the scheduler")
                .build(),
            // Labels: `outcome` ("completed" | "faulted" | "canceled").
            finished: meter
                .u64_counter("workq.work.finished")
                .with_description("Work items that reached a terminal state on a worker")
                .build(),
            duration_ms: meter
                .f64_histogram("workq.work.duration_ms")
                .with_description("Action execution time in milliseconds")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn record_admitted(&self, count: usize) {
        self.admitted.add(count as u64, &[KeyValue::new("result", "ok")]);
    }

    pub fn record_rejected(&self, count: usize) {
        self.admitted.add(count as u64, &[KeyValue::new("result", "rejected")]);
    }

    pub fn record_finished(&self, state: State, duration_ms: f64) {
        self.finished.add(1, &[KeyValue::new("outcome", state.to_string())]);
        self.duration_ms.record(duration_ms, &[]);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
