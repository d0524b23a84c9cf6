//! # Endpoint Factory
//!
//! Turns one raw instance address plus one route into something callable. The HTTP
//! factory allocates a dedicated `reqwest::Client` (and therefore a dedicated
//! connection pool) per endpoint; the returned closer releases it when the instance
//! leaves the pool.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::core::config::TransportConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Instance;
use crate::routing::codec::RouteCodec;
use crate::routing::descriptor::RouteDescriptor;

/// Releases the transport resources held by one endpoint; called exactly once
pub type Closer = Box<dyn FnOnce() + Send + 'static>;

/// Closer for endpoints that hold nothing worth releasing
pub fn noop_closer() -> Closer {
    Box::new(|| {})
}

/// One instance bound to one route, ready to be invoked
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Perform one round trip; must give up once `deadline` passes
    async fn call(&self, request: &Value, deadline: Instant) -> GatewayResult<Value>;
}

/// Builds endpoints from instances the registry reports
pub trait EndpointFactory: Send + Sync {
    fn build(
        &self,
        instance: &Instance,
        route: &RouteDescriptor,
    ) -> GatewayResult<(Arc<dyn Endpoint>, Closer)>;
}

/// Parse an instance address into the URL of `path` on that instance
///
/// Scheme-less addresses get `http://`; anything that is not an http(s) URL with a
/// host is rejected.
pub fn target_url(instance: &Instance, path: &str) -> GatewayResult<Url> {
    let address = instance.address().trim();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let mut url = Url::parse(&candidate)
        .map_err(|e| GatewayError::build(address, format!("Malformed address: {}", e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GatewayError::build(
                address,
                format!("Unsupported scheme '{}'", other),
            ))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(GatewayError::build(address, "Address has no host"));
    }

    url.set_path(path);
    Ok(url)
}

/// Factory producing JSON-over-HTTP endpoints
#[derive(Debug, Clone, Default)]
pub struct HttpEndpointFactory {
    transport: TransportConfig,
}

impl HttpEndpointFactory {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }
}

impl EndpointFactory for HttpEndpointFactory {
    fn build(
        &self,
        instance: &Instance,
        route: &RouteDescriptor,
    ) -> GatewayResult<(Arc<dyn Endpoint>, Closer)> {
        let target = target_url(instance, &route.path)?;

        let client = reqwest::Client::builder()
            .connect_timeout(self.transport.connect_timeout)
            .pool_idle_timeout(self.transport.pool_idle_timeout)
            .pool_max_idle_per_host(self.transport.pool_max_idle_per_host)
            .build()
            .map_err(|e| GatewayError::build(instance.address(), format!("HTTP client: {}", e)))?;

        let endpoint = Arc::new(HttpEndpoint {
            instance: instance.clone(),
            route: route.name.clone(),
            method: route.method.clone(),
            target,
            codec: route.codec.clone(),
            client: RwLock::new(Some(client)),
        });

        let releasable = endpoint.clone();
        let closer: Closer = Box::new(move || releasable.release());
        Ok((endpoint as Arc<dyn Endpoint>, closer))
    }
}

/// JSON-over-HTTP endpoint for one (instance, route) pair
pub struct HttpEndpoint {
    instance: Instance,
    route: String,
    method: Method,
    target: Url,
    codec: Arc<dyn RouteCodec>,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpEndpoint {
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Drop the client and its idle connections; later calls fail as transport errors
    pub fn release(&self) {
        if self.client.write().take().is_some() {
            debug!(instance = %self.instance, route = %self.route, "Released endpoint transport");
        }
    }

    pub fn is_released(&self) -> bool {
        self.client.read().is_none()
    }

    fn transport_error(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::transport(self.instance.address(), message)
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    async fn call(&self, request: &Value, deadline: Instant) -> GatewayResult<Value> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| self.transport_error("endpoint released"))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.transport_error("deadline exceeded before send"));
        }

        let body = self.codec.encode_request(request)?;

        let response = client
            .request(self.method.clone(), self.target.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(remaining)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.transport_error("timed out")
                } else if e.is_connect() {
                    self.transport_error(format!("connection failed: {}", e))
                } else {
                    self.transport_error(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("status {}: {}", status, text.trim())));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(format!("reading response: {}", e)))?;

        self.codec.decode_response(&bytes)
    }
}
