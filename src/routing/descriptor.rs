//! Immutable description of one logical route.

use reqwest::Method;
use std::fmt;
use std::sync::Arc;

use crate::core::config::{RouteConfig, ServiceConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceName;
use crate::routing::codec::{CodecKind, RouteCodec};

/// Everything needed to turn a generic request into a wire call against one
/// instance, and the reply back into a result
#[derive(Clone)]
pub struct RouteDescriptor {
    pub service: ServiceName,
    /// Logical method name (`sum`, `uppercase`, ...)
    pub name: String,
    /// Path clients call on the gateway
    pub inbound_path: String,
    /// HTTP method of the outbound call
    pub method: Method,
    /// Path of the outbound call on each instance
    pub path: String,
    pub codec_kind: CodecKind,
    pub codec: Arc<dyn RouteCodec>,
}

impl RouteDescriptor {
    pub fn new(
        service: ServiceName,
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        codec_kind: CodecKind,
    ) -> Self {
        let name = name.into();
        Self {
            inbound_path: format!("/{}/{}", service, name),
            service,
            name,
            method,
            path: path.into(),
            codec_kind,
            codec: codec_kind.codec(),
        }
    }

    /// Build from validated configuration
    pub fn from_config(service: &ServiceConfig, route: &RouteConfig) -> GatewayResult<Self> {
        let method = Method::from_bytes(route.method.to_uppercase().as_bytes())
            .map_err(|e| GatewayError::config(format!("Invalid method '{}': {}", route.method, e)))?;

        let mut descriptor = Self::new(
            ServiceName::new(&service.name),
            route.name.clone(),
            method,
            route.path.clone(),
            route.codec,
        );
        descriptor.inbound_path = service.inbound_path(route);
        Ok(descriptor)
    }

    /// `service.method`, used as the route label in logs and metrics
    pub fn label(&self) -> String {
        format!("{}.{}", self.service, self.name)
    }
}

impl fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("inbound_path", &self.inbound_path)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("codec", &self.codec_kind)
            .finish()
    }
}
