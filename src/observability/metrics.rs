//! Metric names and the optional Prometheus exporter.
//!
//! Components record through the `metrics` facade; without an installed recorder the
//! macros are no-ops, which keeps tests free of global state.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::core::config::MetricsConfig;
use crate::core::error::{GatewayError, GatewayResult};

pub const DISCOVERY_REFRESHES: &str = "gateway_discovery_refreshes_total";
pub const DISCOVERY_ERRORS: &str = "gateway_discovery_errors_total";
pub const DISCOVERY_INSTANCES: &str = "gateway_discovery_instances";
pub const POOL_ENDPOINTS: &str = "gateway_pool_endpoints";
pub const POOL_BUILD_ERRORS: &str = "gateway_pool_build_errors_total";
pub const BALANCER_SELECTIONS: &str = "gateway_balancer_selections_total";
pub const BALANCER_EMPTY: &str = "gateway_balancer_empty_pool_total";
pub const RETRY_ATTEMPTS: &str = "gateway_retry_attempts_total";
pub const RETRY_EXHAUSTED: &str = "gateway_retry_exhausted_total";
pub const RETRY_CANCELED: &str = "gateway_retry_canceled_total";
pub const REQUEST_DURATION: &str = "gateway_request_duration_seconds";

/// Install the Prometheus exporter when enabled; must run inside the tokio runtime
pub fn init_metrics(config: &MetricsConfig) -> GatewayResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid metrics listen address: {}", e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| GatewayError::internal(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
