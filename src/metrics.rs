//! Prometheus metrics for source queries.

use crate::constants::METRICS_PORT_ENV;
use std::net::SocketAddr;
use tracing::{info, warn};

pub const SOURCE_QUERIES_TOTAL: &str = "geocollect_source_queries_total";
pub const QUERY_ATTEMPTS_TOTAL: &str = "geocollect_query_attempts_total";
pub const QUERY_DURATION_SECONDS: &str = "geocollect_query_duration_seconds";
pub const SOURCE_FAILURES_TOTAL: &str = "geocollect_source_failures_total";

/// Installs the Prometheus exporter when `GEOCOLLECT_METRICS_PORT` is set.
/// Without an exporter the recording calls below are no-ops.
pub fn init_metrics() {
    let Some(port) = std::env::var(METRICS_PORT_ENV)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed (possibly already installed): {}", e),
    }
}

/// One call to a remote service, successful or not.
pub fn record_attempt(source: &str, duration_secs: f64) {
    ::metrics::counter!(QUERY_ATTEMPTS_TOTAL, "source" => source.to_string()).increment(1);
    ::metrics::histogram!(QUERY_DURATION_SECONDS, "source" => source.to_string()).record(duration_secs);
}

/// Final status of one source in a run.
pub fn record_outcome(source: &str, status: &str) {
    ::metrics::counter!(
        SOURCE_QUERIES_TOTAL,
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_failure(source: &str, kind: &str) {
    ::metrics::counter!(
        SOURCE_FAILURES_TOTAL,
        "source" => source.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}
