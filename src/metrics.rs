//! Prometheus metrics for dripflow.
//!
//! ## Metrics
//!
//! ### Counters
//! - `dripflow_enrollments_total` - Contacts enrolled, by automation
//! - `dripflow_runs_finished_total` - Runs reaching a terminal state, by exit reason
//! - `dripflow_node_executions_total` - Node visits by node_type and action
//! - `dripflow_run_retries_total` - Transient failures scheduled for retry
//! - `dripflow_scheduler_claimed_total` - Due runs claimed by this worker
//!
//! ### Histograms
//! - `dripflow_scheduler_poll_duration_seconds` - Time spent in one scheduler pass

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{Error, Result};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime, once per process.
pub fn serve_metrics(addr: SocketAddr) -> Result<()> {
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    let (recorder, exporter) = builder
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build Prometheus exporter: {}", e)))?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::Internal(format!("Failed to install metrics recorder: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!("Metrics exporter stopped: {:?}", e);
        }
    });
    Ok(())
}

// =============================================================================
// Run Metrics
// =============================================================================

pub fn record_enrollment(automation_id: &str) {
    counter!(
        "dripflow_enrollments_total",
        "automation_id" => automation_id.to_string()
    )
    .increment(1);
}

pub fn record_run_finished(reason: &str) {
    counter!(
        "dripflow_runs_finished_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_node_execution(node_type: &str, action: &str) {
    counter!(
        "dripflow_node_executions_total",
        "node_type" => node_type.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

pub fn record_retry() {
    counter!("dripflow_run_retries_total").increment(1);
}

// =============================================================================
// Scheduler Metrics
// =============================================================================

pub fn record_claimed(count: usize) {
    counter!("dripflow_scheduler_claimed_total").increment(count as u64);
}

pub fn record_poll_duration(duration: Duration) {
    histogram!("dripflow_scheduler_poll_duration_seconds").record(duration.as_secs_f64());
}
