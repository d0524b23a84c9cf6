//! Fixed association between one exposed method and the orchestrator that serves it.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::GatewayResult;
use crate::core::types::CallContext;
use crate::endpoint::pool::EndpointPool;
use crate::load_balancing::retry::RetryOrchestrator;
use crate::routing::descriptor::RouteDescriptor;

/// One route wired to its pool and retry orchestrator; immutable after construction
pub struct RouteBinding {
    descriptor: Arc<RouteDescriptor>,
    orchestrator: RetryOrchestrator,
    pool: Arc<EndpointPool>,
}

impl RouteBinding {
    pub fn new(
        descriptor: Arc<RouteDescriptor>,
        orchestrator: RetryOrchestrator,
        pool: Arc<EndpointPool>,
    ) -> Self {
        Self {
            descriptor,
            orchestrator,
            pool,
        }
    }

    pub fn descriptor(&self) -> &Arc<RouteDescriptor> {
        &self.descriptor
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// Number of endpoints currently eligible for selection
    pub fn endpoint_count(&self) -> usize {
        self.pool.current().len()
    }

    /// Route one decoded request; `cancel` aborts the call mid-attempt
    pub async fn handle(&self, request: Value, cancel: CancellationToken) -> GatewayResult<Value> {
        let ctx = CallContext::with_budget(self.orchestrator.policy().timeout).with_cancellation(cancel);
        self.orchestrator.invoke_with(&request, ctx).await
    }

    /// Decode a raw inbound body, route it, and encode the reply for the client
    pub async fn handle_body(&self, body: &[u8], cancel: CancellationToken) -> GatewayResult<Bytes> {
        let codec = &self.descriptor.codec;
        let request = codec.decode_request(body)?;
        debug!(route = %self.descriptor.label(), "Routing request");

        let response = self.handle(request, cancel).await?;
        codec.encode_response(&response)
    }
}
