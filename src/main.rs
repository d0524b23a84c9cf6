//! # Edge Gateway - Main Entry Point
//!
//! Startup sequence:
//!
//! 1. Load configuration (`GATEWAY_CONFIG_PATH` or defaults, plus env overrides)
//! 2. Initialize logging and the optional Prometheus exporter
//! 3. Discover every configured service; any failure here exits with status 1
//! 4. Serve until SIGINT/SIGTERM, then drain in-flight requests and stop discovery

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use edge_gateway::core::config::LogConfig;
use edge_gateway::discovery::registry::ConsulClient;
use edge_gateway::endpoint::factory::HttpEndpointFactory;
use edge_gateway::observability::{init_logging, init_metrics};
use edge_gateway::{Gateway, GatewayConfig, GatewayError, GatewayResult, GatewayServer, ShutdownCoordinator};

#[tokio::main]
async fn main() {
    let config = match GatewayConfig::load().await {
        Ok(config) => config,
        Err(e) => {
            let _ = init_logging(&LogConfig::default());
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.observability.logging) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting edge gateway");

    if let Err(e) = run(config).await {
        error!(error = %e, "Gateway terminated");
        std::process::exit(1);
    }

    info!("Edge gateway shutdown complete");
}

async fn run(config: GatewayConfig) -> GatewayResult<()> {
    init_metrics(&config.observability.metrics)?;

    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let registry = Arc::new(ConsulClient::new(&config.registry)?);
    let factory = Arc::new(HttpEndpointFactory::new(config.transport.clone()));

    let gateway = Gateway::build(&config, registry, factory, &shutdown).await?;

    let listener = TcpListener::bind(&config.server.listen_address)
        .await
        .map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind {}: {}",
                config.server.listen_address, e
            ))
        })?;

    let server = GatewayServer::new(&gateway, &config.server, shutdown.clone());
    let mut serving = tokio::spawn(server.serve(listener));

    tokio::select! {
        signal = shutdown.wait_for_signal() => signal?,
        finished = &mut serving => {
            // The listener only returns on its own when it failed.
            shutdown.initiate();
            shutdown.complete(async {}).await;
            return finished.map_err(|e| GatewayError::internal(format!("Server task failed: {}", e)))?;
        }
    }

    let graceful = shutdown
        .complete(async move {
            match serving.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Listener stopped with an error"),
                Err(e) => warn!(error = %e, "Server task failed"),
            }
        })
        .await;

    if !graceful {
        warn!("Some requests were canceled during shutdown");
    }

    Ok(())
}
