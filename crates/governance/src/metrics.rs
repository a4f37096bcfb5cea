//! Sandbox metrics exported through Prometheus.
//!
//! The helpers are no-ops until a recorder is installed, so library code
//! and tests can call them unconditionally.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use workspace_sandbox_core::{Error, ErrorKind, Result, SandboxStatus};

/// Install the Prometheus recorder, optionally serving `/metrics` on `listen`.
pub fn setup_metrics_recorder(listen: Option<SocketAddr>) -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = match listen {
        Some(addr) => {
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| Error::Config(format!("Failed to build Prometheus exporter: {}", e)))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Prometheus exporter stopped");
                }
            });
            tracing::info!(listen = %addr, "Prometheus scrape endpoint listening");
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| Error::Config(format!("Failed to install Prometheus recorder: {}", e)))?,
    };

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Count a committed status change.
pub fn track_transition(from: SandboxStatus, to: SandboxStatus) {
    metrics::counter!(
        "sandbox_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Count a request refused before mutation.
pub fn track_rejection(kind: ErrorKind) {
    metrics::counter!("sandbox_rejected_requests_total", "kind" => kind.as_str()).increment(1);
}

pub fn track_driver_failure(driver: &str, op: &'static str) {
    metrics::counter!(
        "sandbox_driver_failures_total",
        "driver" => driver.to_string(),
        "op" => op
    )
    .increment(1);
}

/// Record how long a manager operation took.
pub fn track_operation(op: &'static str, latency_sec: f64) {
    metrics::histogram!("sandbox_operation_duration_seconds", "op" => op).record(latency_sec);
}
