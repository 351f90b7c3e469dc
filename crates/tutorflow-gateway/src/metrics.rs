//! Prometheus metrics recording and endpoint.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")
}

pub fn record_ws_connect() {
    metrics::gauge!("tutorflow_ws_connections_active").increment(1.0);
}

pub fn record_ws_disconnect() {
    metrics::gauge!("tutorflow_ws_connections_active").decrement(1.0);
}

/// Record a WS method request with its duration.
pub fn record_request(method: &str, duration_secs: f64) {
    let labels = [("method", method.to_string())];
    metrics::counter!("tutorflow_ws_requests_total", &labels).increment(1);
    metrics::histogram!("tutorflow_ws_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a turn cancelled by the client or a disconnect.
pub fn record_turn_cancelled() {
    metrics::counter!("tutorflow_turns_cancelled_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_ws_connect();
        record_ws_disconnect();
        record_request("turn.send", 0.25);
        record_turn_cancelled();
    }

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install reports an error.
        if let Ok(handle) = install_prometheus_recorder() {
            record_request("responders.list", 0.01);
            assert!(handle.render().contains("tutorflow_ws_requests_total"));
        }
    }
}
