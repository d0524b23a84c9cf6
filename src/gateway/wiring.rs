//! # Gateway Wiring
//!
//! Builds the runtime object graph once at startup:
//!
//! ```text
//! RegistryClient ──> InstanceWatcher (one per service)
//!                        │
//!                        ├──> EndpointPool ──> RoundRobin ──> RetryOrchestrator ──> RouteBinding
//!                        └──> EndpointPool ──> ...           (one chain per route)
//! ```
//!
//! Nothing here is rebuilt per request. Watchers and pools run on the shutdown
//! coordinator's tracker and stop when its background token fires.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::config::{GatewayConfig, ServiceConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::types::{RetryPolicy, ServiceName};
use crate::discovery::registry::RegistryClient;
use crate::discovery::watcher::{InstanceWatcher, WatchSettings};
use crate::endpoint::factory::EndpointFactory;
use crate::endpoint::pool::EndpointPool;
use crate::load_balancing::balancer::RoundRobin;
use crate::load_balancing::retry::RetryOrchestrator;
use crate::routing::binding::RouteBinding;
use crate::routing::descriptor::RouteDescriptor;

/// Services sharing a name and tag set share one watcher
type WatchKey = (String, Vec<String>);

fn watch_key(service: &ServiceConfig) -> WatchKey {
    let mut tags = service.tags.clone();
    tags.sort();
    tags.dedup();
    (service.name.clone(), tags)
}

/// Every route binding of a running gateway
pub struct Gateway {
    bindings: Vec<Arc<RouteBinding>>,
    watchers: Vec<InstanceWatcher>,
    policy: RetryPolicy,
}

impl Gateway {
    /// Start discovery for every configured service and wire one binding per route
    ///
    /// Fails when the configuration is invalid or any service's initial instance
    /// fetch fails.
    pub async fn build(
        config: &GatewayConfig,
        registry: Arc<dyn RegistryClient>,
        factory: Arc<dyn EndpointFactory>,
        shutdown: &ShutdownCoordinator,
    ) -> GatewayResult<Self> {
        config.validate()?;
        let policy = RetryPolicy::from(&config.retry);

        let mut keys: Vec<WatchKey> = Vec::new();
        for service in &config.services {
            let key = watch_key(service);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let starts = keys.iter().map(|(name, tags)| {
            InstanceWatcher::start(
                registry.clone(),
                ServiceName::new(name),
                WatchSettings::from_config(&config.registry, tags.clone()),
                shutdown.background_token(),
                shutdown.tracker(),
            )
        });
        let watchers = try_join_all(starts).await?;
        let by_key: HashMap<&WatchKey, &InstanceWatcher> = keys.iter().zip(watchers.iter()).collect();

        let mut bindings = Vec::new();
        for service in &config.services {
            let key = watch_key(service);
            let watcher = by_key.get(&key).ok_or_else(|| {
                GatewayError::internal(format!("No watcher started for service '{}'", service.name))
            })?;

            for route in &service.routes {
                let descriptor = Arc::new(RouteDescriptor::from_config(service, route)?);
                let pool = EndpointPool::spawn(
                    descriptor.clone(),
                    factory.clone(),
                    watcher,
                    shutdown.background_token(),
                    shutdown.tracker(),
                );
                let balancer = Arc::new(RoundRobin::new(pool.clone()));
                let orchestrator = RetryOrchestrator::new(balancer, policy, descriptor.label());

                info!(
                    route = %descriptor.label(),
                    path = %descriptor.inbound_path,
                    endpoints = pool.current().len(),
                    "Route bound"
                );
                bindings.push(Arc::new(RouteBinding::new(descriptor, orchestrator, pool)));
            }
        }

        info!(
            services = watchers.len(),
            routes = bindings.len(),
            max_attempts = policy.max_attempts,
            timeout_ms = policy.timeout.as_millis() as u64,
            "Gateway wired"
        );

        Ok(Self {
            bindings,
            watchers,
            policy,
        })
    }

    pub fn bindings(&self) -> &[Arc<RouteBinding>] {
        &self.bindings
    }

    pub fn watchers(&self) -> &[InstanceWatcher] {
        &self.watchers
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Binding mounted at `path`, if any
    pub fn binding(&self, path: &str) -> Option<&Arc<RouteBinding>> {
        self.bindings
            .iter()
            .find(|binding| binding.descriptor().inbound_path == path)
    }
}
