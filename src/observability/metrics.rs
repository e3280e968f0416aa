//! Metrics collection and exposition.
//!
//! # Metrics
//! - `routeway_requests_total` (counter): requests by transport, route, status
//! - `routeway_request_duration_seconds` (histogram): pipeline latency
//! - `routeway_rate_limited_total` (counter): requests rejected by the limiter
//! - `routeway_rate_limit_delay_seconds` (histogram): imposed slow-down delays
//! - `routeway_cache_lookups_total` (counter): cache lookups by result
//! - `routeway_rpc_calls_total` (counter): outbound RPC calls by outcome
//! - `routeway_rpc_pending_calls` (gauge): calls awaiting a reply
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs the exporter
//! - Route names (not raw paths) are used as labels to bound cardinality

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "routeway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "routeway_request_duration_seconds";
    pub const RATE_LIMITED_TOTAL: &str = "routeway_rate_limited_total";
    pub const RATE_LIMIT_DELAY_SECONDS: &str = "routeway_rate_limit_delay_seconds";
    pub const CACHE_LOOKUPS_TOTAL: &str = "routeway_cache_lookups_total";
    pub const RPC_CALLS_TOTAL: &str = "routeway_rpc_calls_total";
    pub const RPC_PENDING_CALLS: &str = "routeway_rpc_pending_calls";
}

/// Install the Prometheus exporter with its own HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install Prometheus exporter"),
    }
}

/// Record a finished request on either transport.
pub fn record_request(transport: &'static str, route: &str, status: u16, duration: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "transport" => transport,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::REQUEST_DURATION_SECONDS,
        "transport" => transport,
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_rate_limited(route: &str) {
    counter!(names::RATE_LIMITED_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn record_rate_limit_delay(delay: Duration) {
    if !delay.is_zero() {
        histogram!(names::RATE_LIMIT_DELAY_SECONDS).record(delay.as_secs_f64());
    }
}

/// `result` is one of `hit`, `miss`, `corrupt`.
pub fn record_cache_lookup(result: &'static str) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

/// `outcome` is one of `ok`, `remote_error`, `timeout`, `closed`.
pub fn record_rpc_call(outcome: &'static str) {
    counter!(names::RPC_CALLS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_rpc_pending(count: usize) {
    gauge!(names::RPC_PENDING_CALLS).set(count as f64);
}
