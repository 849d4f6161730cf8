//! Metrics collection and exposition.
//!
//! # Metrics
//! - `hostnet_connections_accepted_total` (counter): inbound sockets admitted
//! - `hostnet_accept_errors_total` (counter): failed accept attempts
//! - `hostnet_network_state` (gauge): 0=stopped 1=starting 2=running 3=stopping
//! - `hostnet_upnp_mappings_total` (counter): traversal outcomes by `result`
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::NetworkState;

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    metrics::counter!("hostnet_connections_accepted_total").increment(1);
}

pub fn record_accept_error() {
    metrics::counter!("hostnet_accept_errors_total").increment(1);
}

pub fn record_network_state(state: NetworkState) {
    metrics::gauge!("hostnet_network_state").set(state as u8 as f64);
}

pub fn record_upnp_mapping(result: &'static str) {
    metrics::counter!("hostnet_upnp_mappings_total", "result" => result).increment(1);
}
