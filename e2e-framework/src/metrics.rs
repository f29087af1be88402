//! Prometheus metrics for the E2E harness
//!
//! Counts scenario outcomes, wait-loop iterations, backend commands and
//! dispatched tasks so long runs can be watched from a dashboard.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub mod names {
    /// Counter: Scenarios by suite and terminal state
    pub const E2E_SCENARIOS_TOTAL: &str = "e2e_scenarios_total";
    /// Histogram: Scenario wall-clock duration in seconds
    pub const E2E_SCENARIO_DURATION_SECONDS: &str = "e2e_scenario_duration_seconds";
    /// Counter: Wait-loop completions by outcome (done, timeout, fatal)
    pub const E2E_POLL_ITERATIONS_TOTAL: &str = "e2e_poll_iterations_total";
    /// Counter: Backend (toolbox) commands by status
    pub const E2E_BACKEND_COMMANDS_TOTAL: &str = "e2e_backend_commands_total";
    /// Counter: Dispatched tasks by operation and status
    pub const E2E_DISPATCH_TASKS_TOTAL: &str = "e2e_dispatch_tasks_total";
    /// Histogram: Duration of cluster operations in seconds
    pub const E2E_OPERATION_DURATION_SECONDS: &str = "e2e_operation_duration_seconds";
}

/// Serve `/metrics` on `addr` for the rest of the run.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Prometheus exporter started");
    Ok(())
}

/// Record a scenario reaching a terminal state
pub fn record_scenario(suite: &str, state: &str, duration_secs: f64) {
    counter!(names::E2E_SCENARIOS_TOTAL, "suite" => suite.to_string(), "state" => state.to_string())
        .increment(1);
    histogram!(names::E2E_SCENARIO_DURATION_SECONDS, "suite" => suite.to_string())
        .record(duration_secs);
}

/// Record how a wait loop ended
pub fn record_poll(outcome: &'static str, iterations: u64) {
    counter!(names::E2E_POLL_ITERATIONS_TOTAL, "outcome" => outcome).increment(iterations);
}

pub fn record_backend_command(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(names::E2E_BACKEND_COMMANDS_TOTAL, "status" => status).increment(1);
}

pub fn record_dispatch(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(names::E2E_DISPATCH_TASKS_TOTAL, "operation" => operation.to_string(), "status" => status)
        .increment(1);
}

/// Times one cluster operation into the duration histogram.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn success(self) {
        self.finish("success");
    }

    /// `error_kind` becomes the status label.
    pub fn failure(self, error_kind: &str) {
        self.finish(error_kind);
    }

    fn finish(self, status: &str) {
        histogram!(
            names::E2E_OPERATION_DURATION_SECONDS,
            "operation" => self.operation,
            "status" => status.to_string()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
