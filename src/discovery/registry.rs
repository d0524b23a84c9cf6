//! # Registry Clients
//!
//! A [`RegistryClient`] answers one question: which instances of a service are
//! currently healthy. Two implementations are provided:
//!
//! - [`ConsulClient`] talks to a Consul agent over its HTTP API and supports blocking
//!   queries, so a watcher learns about changes as soon as the agent does.
//! - [`StaticRegistry`] keeps instances in memory. It backs tests and deployments
//!   without a registry, and can simulate an outage.
//!
//! The client is built once at startup and handed to every watcher; there is no
//! process-wide registry handle.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use url::Url;

use crate::core::config::RegistryConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Instance, ServiceName};

/// Header carrying the Consul raft index used for blocking queries
pub const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";

const CONSUL_TOKEN_HEADER: &str = "X-Consul-Token";

/// Options for one instance query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Every returned instance must carry all of these tags
    pub tags: Vec<String>,
    /// Block until the registry index moves past this value
    pub index: Option<u64>,
    /// Longest time the registry may hold a blocking query
    pub wait: Option<Duration>,
}

/// Result of one instance query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Healthy instances, de-duplicated and sorted by address
    pub instances: Vec<Instance>,
    /// Registry index to pass to the next blocking query
    pub index: u64,
}

/// Handle to the external service registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Healthy instances of `service`, blocking per `options` when an index is given
    async fn healthy_instances(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> GatewayResult<InstanceQuery>;
}

/// Consul health endpoint entry; only the fields we read
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: ConsulNode,
    service: ConsulService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulService {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl HealthEntry {
    /// Service address, falling back to the node address, joined with the port
    fn instance(&self) -> Instance {
        let host = if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        };

        if host.contains(':') && !host.starts_with('[') {
            Instance::new(format!("[{}]:{}", host, self.service.port))
        } else {
            Instance::new(format!("{}:{}", host, self.service.port))
        }
    }

    fn has_tags(&self, tags: &[String]) -> bool {
        let own = self.service.tags.as_deref().unwrap_or_default();
        tags.iter().all(|tag| own.contains(tag))
    }
}

/// Consul service discovery over the agent HTTP API
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    datacenter: Option<String>,
    token: Option<String>,
    passing_only: bool,
}

impl ConsulClient {
    /// Create a client for the configured agent; does not contact the agent
    pub fn new(config: &RegistryConfig) -> GatewayResult<Self> {
        let base = Self::agent_url(&config.address)?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to create Consul HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
            passing_only: config.passing_only,
        })
    }

    /// Normalize `:8500`, `host:8500` and full URLs into an agent base URL
    pub fn agent_url(address: &str) -> GatewayResult<Url> {
        let address = address.trim();
        let with_host = if address.starts_with(':') {
            format!("127.0.0.1{}", address)
        } else {
            address.to_string()
        };
        let with_scheme = if with_host.contains("://") {
            with_host
        } else {
            format!("http://{}", with_host)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| GatewayError::config(format!("Invalid registry address '{}': {}", address, e)))?;
        if url.host_str().is_none() {
            return Err(GatewayError::config(format!(
                "Registry address '{}' has no host",
                address
            )));
        }
        Ok(url)
    }

    /// Consul adds up to wait/16 of jitter to blocking queries
    fn request_timeout(wait: Option<Duration>) -> Duration {
        match wait {
            Some(wait) => wait + wait / 16 + Duration::from_secs(5),
            None => Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn healthy_instances(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> GatewayResult<InstanceQuery> {
        let url = self
            .base
            .join(&format!("v1/health/service/{}", service))
            .map_err(|e| GatewayError::discovery(service.as_str(), format!("Invalid service URL: {}", e)))?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if self.passing_only {
            params.push(("passing", "1".to_string()));
        }
        // Consul filters on one tag server-side; the rest are checked below.
        if let Some(tag) = options.tags.first() {
            params.push(("tag", tag.clone()));
        }
        if let Some(dc) = &self.datacenter {
            params.push(("dc", dc.clone()));
        }
        if let Some(index) = options.index {
            params.push(("index", index.to_string()));
            if let Some(wait) = options.wait {
                params.push(("wait", format!("{}ms", wait.as_millis())));
            }
        }

        let mut request = self
            .http
            .get(url)
            .query(&params)
            .timeout(Self::request_timeout(options.index.and(options.wait)));
        if let Some(token) = &self.token {
            request = request.header(CONSUL_TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::discovery(service.as_str(), format!("Registry unreachable: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::discovery(
                service.as_str(),
                format!("Registry returned {}: {}", status, body.trim()),
            ));
        }

        let index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| GatewayError::discovery(service.as_str(), format!("Invalid registry response: {}", e)))?;

        let mut instances: Vec<Instance> = entries
            .iter()
            .filter(|entry| entry.has_tags(&options.tags))
            .map(HealthEntry::instance)
            .collect();
        instances.sort();
        instances.dedup();

        debug!(
            service = %service,
            index,
            instances = instances.len(),
            "Consul health query completed"
        );

        Ok(InstanceQuery { instances, index })
    }
}

/// In-memory registry for tests and static deployments
pub struct StaticRegistry {
    services: DashMap<String, Vec<Instance>>,
    version: AtomicU64,
    changed: Notify,
    unavailable: AtomicBool,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            version: AtomicU64::new(1),
            changed: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Replace the healthy set of a service and wake blocked queries
    pub fn set_instances<I, S>(&self, service: &str, instances: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let instances = instances.into_iter().map(Instance::new).collect();
        self.services.insert(service.to_string(), instances);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Simulate the registry going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn index(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn healthy_instances(
        &self,
        service: &ServiceName,
        options: &QueryOptions,
    ) -> GatewayResult<InstanceQuery> {
        // Register for wake-ups before reading the version so no change slips between.
        let notified = self.changed.notified();

        if let (Some(index), Some(wait)) = (options.index, options.wait) {
            if index >= self.index() && !self.unavailable.load(Ordering::SeqCst) {
                let _ = tokio::time::timeout(wait, notified).await;
            }
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::discovery(service.as_str(), "Registry unreachable"));
        }

        let mut instances = self
            .services
            .get(service.as_str())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        instances.sort();
        instances.dedup();

        Ok(InstanceQuery {
            instances,
            index: self.index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_url_normalization() {
        assert_eq!(ConsulClient::agent_url(":8500").unwrap().as_str(), "http://127.0.0.1:8500/");
        assert_eq!(
            ConsulClient::agent_url("consul.local:8500").unwrap().as_str(),
            "http://consul.local:8500/"
        );
        assert_eq!(
            ConsulClient::agent_url("https://consul.example.com").unwrap().as_str(),
            "https://consul.example.com/"
        );
    }

    #[test]
    fn test_health_entry_address_fallback() {
        let entries: Vec<HealthEntry> = serde_json::from_str(
            r#"[
                {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "", "Port": 8080, "Tags": null}},
                {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "10.1.0.7", "Port": 9090, "Tags": ["v2"]}},
                {"Node": {"Address": "::1"}, "Service": {"Address": "", "Port": 8081}}
            ]"#,
        )
        .unwrap();

        assert_eq!(entries[0].instance().address(), "10.0.0.1:8080");
        assert_eq!(entries[1].instance().address(), "10.1.0.7:9090");
        assert_eq!(entries[2].instance().address(), "[::1]:8081");
        assert!(entries[1].has_tags(&["v2".to_string()]));
        assert!(!entries[0].has_tags(&["v2".to_string()]));
    }

    #[tokio::test]
    async fn test_static_registry_blocks_until_change() {
        let registry = std::sync::Arc::new(StaticRegistry::new());
        registry.set_instances("addsvc", ["10.0.0.2:80", "10.0.0.1:80", "10.0.0.1:80"]);
        let service = ServiceName::new("addsvc");

        let first = registry
            .healthy_instances(&service, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(first.instances, vec![Instance::from("10.0.0.1:80"), Instance::from("10.0.0.2:80")]);

        let blocked = {
            let registry = registry.clone();
            let service = service.clone();
            tokio::spawn(async move {
                let options = QueryOptions {
                    index: Some(first.index),
                    wait: Some(Duration::from_secs(5)),
                    ..Default::default()
                };
                registry.healthy_instances(&service, &options).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.set_instances("addsvc", ["10.0.0.3:80"]);

        let next = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next.instances, vec![Instance::from("10.0.0.3:80")]);
        assert!(next.index > first.index);
    }

    #[tokio::test]
    async fn test_static_registry_outage() {
        let registry = StaticRegistry::new();
        registry.set_available(false);

        let err = registry
            .healthy_instances(&ServiceName::new("addsvc"), &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Discovery { .. }));
    }
}
