//! # HTTP Server Module
//!
//! The boundary listener. Every route binding is mounted at its inbound path and
//! accepts any method; the body is decoded by the route codec, routed through the
//! binding and the reply encoded back. Routing failures become JSON error bodies
//! through `GatewayError`'s `IntoResponse`.
//!
//! Each request gets a `uuid` request id recorded on its tracing span, and carries a
//! shutdown token so the retry loop can be aborted once the grace period ends.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router as AxumRouter,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::core::config::ServerConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::shutdown::ShutdownCoordinator;
use crate::gateway::wiring::Gateway;
use crate::load_balancing::balancer::Balancer;
use crate::observability::metrics::REQUEST_DURATION;
use crate::routing::binding::RouteBinding;

/// State of one mounted route
#[derive(Clone)]
struct RouteState {
    binding: Arc<RouteBinding>,
    shutdown: ShutdownCoordinator,
}

/// State of the health endpoint
#[derive(Clone)]
struct HealthState {
    bindings: Arc<Vec<Arc<RouteBinding>>>,
}

/// Boundary HTTP server for a wired gateway
pub struct GatewayServer {
    app: AxumRouter,
    shutdown: ShutdownCoordinator,
}

impl GatewayServer {
    pub fn new(gateway: &Gateway, config: &ServerConfig, shutdown: ShutdownCoordinator) -> Self {
        let mut app = AxumRouter::new();

        for binding in gateway.bindings() {
            let path = binding.descriptor().inbound_path.clone();
            let state = RouteState {
                binding: binding.clone(),
                shutdown: shutdown.clone(),
            };
            app = app.merge(AxumRouter::new().route(&path, any(handle_route)).with_state(state));
        }

        let health = HealthState {
            bindings: Arc::new(gateway.bindings().to_vec()),
        };
        app = app.merge(AxumRouter::new().route("/health", get(health_check)).with_state(health));

        let app = app.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    info_span!(
                        "request",
                        request_id = %Uuid::new_v4(),
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                }))
                .layer(DefaultBodyLimit::max(config.max_body_size)),
        );

        Self { app, shutdown }
    }

    /// The assembled router, for serving on a custom listener or in tests
    pub fn router(&self) -> AxumRouter {
        self.app.clone()
    }

    /// Serve until the coordinator stops accepting, then drain open connections
    pub async fn serve(self, listener: TcpListener) -> GatewayResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Gateway listening");

        let stop = self.shutdown.stop_accepting_token();
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

        info!("Gateway listener stopped");
        Ok(())
    }
}

/// Route one inbound call through its binding
async fn handle_route(State(state): State<RouteState>, body: Bytes) -> Response {
    let started = Instant::now();
    let label = state.binding.descriptor().label();

    let result = state
        .binding
        .handle_body(&body, state.shutdown.request_token())
        .await;

    let outcome = match &result {
        Ok(_) => "success",
        Err(e) => e.error_type(),
    };
    metrics::histogram!(REQUEST_DURATION, "route" => label.clone(), "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(encoded) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            encoded,
        )
            .into_response(),
        Err(e) => {
            warn!(route = %label, error = %e, status = e.status_code().as_u16(), "Request failed");
            e.into_response()
        }
    }
}

/// Gateway health: reports how many endpoints each route can currently select from
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let routes: Vec<_> = state
        .bindings
        .iter()
        .map(|binding| {
            let descriptor = binding.descriptor();
            let stats = binding.orchestrator().balancer().stats();
            json!({
                "route": descriptor.label(),
                "path": descriptor.inbound_path,
                "endpoints": binding.endpoint_count(),
                "algorithm": stats.algorithm,
                "selections": stats.total_selections,
            })
        })
        .collect();

    let degraded = state.bindings.iter().any(|binding| binding.endpoint_count() == 0);

    let health_info = json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "service": "edge-gateway",
        "routes": routes,
    });

    (StatusCode::OK, Json(health_info))
}
