//! Prometheus metrics for weft.
//!
//! Metrics are recorded through the `metrics` facade at the point of
//! use and exposed via the /metrics endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `weft_runs_started_total` - Runs started
//! - `weft_runs_completed_total` - Runs finished, by terminal status
//! - `weft_node_executions_total` - Node decisions by kind and status
//! - `weft_node_retries_total` - Retry attempts scheduled, by kind
//! - `weft_events_dropped_total` - Events lost to a full buffer
//!
//! ### Histograms
//! - `weft_node_duration_seconds` - Capability attempt duration by kind
//!
//! ### Gauges
//! - `weft_active_runs` - Runs currently being driven

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_before_init_does_not_panic() {
        let _ = render_metrics();
    }
}
