//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the configured
//! level so operators can turn on debug output for one module without editing config.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::config::LogConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Initialize the global subscriber from the logging configuration
pub fn init_logging(config: &LogConfig) -> GatewayResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.format.eq_ignore_ascii_case("text") {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init()
    };

    result.map_err(|e| GatewayError::internal(format!("Failed to initialize logging: {}", e)))?;

    info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("edge_gateway={},tower_http=info", level.to_lowercase())
}
