//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Metric names as constants for consistency.
pub mod names {
    // Job lifecycle
    pub const JOBS_STARTED_TOTAL: &str = "vgen_jobs_started_total";
    pub const JOBS_FINISHED_TOTAL: &str = "vgen_jobs_finished_total";
    pub const JOBS_ACTIVE: &str = "vgen_jobs_active";
    pub const STAGE_DURATION_SECONDS: &str = "vgen_stage_duration_seconds";

    // Providers
    pub const PROVIDER_FALLBACKS_TOTAL: &str = "vgen_provider_fallbacks_total";

    // Exports
    pub const EXPORTS_FINISHED_TOTAL: &str = "vgen_exports_finished_total";

    // Processes reaped by job cancellation (per-kill outcomes are counted by the registry)
    pub const CANCEL_PROCESSES_KILLED_TOTAL: &str = "vgen_cancel_processes_killed_total";

    // Queue
    pub const QUEUE_DISPATCHED_TOTAL: &str = "vgen_queue_dispatched_total";
    pub const QUEUE_STALE_REAPED_TOTAL: &str = "vgen_queue_stale_reaped_total";
    pub const QUEUE_SESSION_ERRORS_TOTAL: &str = "vgen_queue_session_errors_total";
}

/// Serve Prometheus metrics on `addr`. Must be called inside the runtime.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn record_job_started() {
    counter!(names::JOBS_STARTED_TOTAL).increment(1);
    gauge!(names::JOBS_ACTIVE).increment(1.0);
}

/// `outcome` is the terminal state name.
pub fn record_job_finished(outcome: &'static str) {
    counter!(names::JOBS_FINISHED_TOTAL, "outcome" => outcome).increment(1);
    gauge!(names::JOBS_ACTIVE).decrement(1.0);
}

pub fn record_stage_duration(stage: &'static str, provider: &str, secs: f64) {
    histogram!(
        names::STAGE_DURATION_SECONDS,
        "stage" => stage,
        "provider" => provider.to_string()
    )
    .record(secs);
}

pub fn record_provider_fallback(stage: &'static str, provider: &str) {
    counter!(
        names::PROVIDER_FALLBACKS_TOTAL,
        "stage" => stage,
        "provider" => provider.to_string()
    )
    .increment(1);
}

pub fn record_export_finished(outcome: &'static str) {
    counter!(names::EXPORTS_FINISHED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_processes_killed(count: usize) {
    counter!(names::CANCEL_PROCESSES_KILLED_TOTAL).increment(count as u64);
}

pub fn record_queue_dispatch() {
    counter!(names::QUEUE_DISPATCHED_TOTAL).increment(1);
}

/// `action` is `requeued` or `failed`.
pub fn record_stale_reaped(action: &'static str) {
    counter!(names::QUEUE_STALE_REAPED_TOTAL, "action" => action).increment(1);
}

pub fn record_queue_session_error(phase: &'static str) {
    counter!(names::QUEUE_SESSION_ERRORS_TOTAL, "phase" => phase).increment(1);
}
