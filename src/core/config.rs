//! # Configuration Module
//!
//! Process configuration for the edge gateway: where to listen, where the registry
//! lives, the shared retry budget and the fixed table of routes.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable override support
//! - Validation that reports every problem at once
//! - Defaults that reproduce the stock `addsvc` / `stringsvc` route table

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::codec::CodecKind;

/// Environment variable naming the YAML configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener settings
    pub server: ServerConfig,

    /// Service registry (Consul agent) settings
    pub registry: RegistryConfig,

    /// Retry budget shared by every route
    pub retry: RetryPolicyConfig,

    /// Per-instance HTTP client settings
    pub transport: TransportConfig,

    /// Downstream services and the routes they implement
    pub services: Vec<ServiceConfig>,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            retry: RetryPolicyConfig::default(),
            transport: TransportConfig::default(),
            services: default_services(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, then apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `GATEWAY_CONFIG_PATH` when set, otherwise start from defaults
    pub async fn load() -> GatewayResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path).await,
            Err(_) => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse a YAML document without touching the environment
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Variables follow the pattern `GATEWAY_<FIELD>`, e.g. `GATEWAY_RETRY_MAX=5`.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_LISTEN_ADDRESS") {
            self.server.listen_address = addr;
        }

        if let Ok(addr) = env::var("GATEWAY_REGISTRY_ADDRESS") {
            self.registry.address = addr;
        }

        if let Ok(max) = env::var("GATEWAY_RETRY_MAX") {
            self.retry.max_attempts = max
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RETRY_MAX: {}", e)))?;
        }

        if let Ok(timeout) = env::var("GATEWAY_RETRY_TIMEOUT") {
            self.retry.timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_RETRY_TIMEOUT: {}", e)))?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        if let Ok(enabled) = env::var("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.enabled = enabled
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.listen_address.is_empty() {
            errors.push("server.listen_address cannot be empty".to_string());
        }

        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        if self.registry.address.is_empty() {
            errors.push("registry.address cannot be empty".to_string());
        }

        if self.registry.retry_interval.is_zero() {
            errors.push("registry.retry_interval must be greater than 0".to_string());
        }

        if self.registry.max_retry_interval < self.registry.retry_interval {
            errors.push("registry.max_retry_interval must not be below retry_interval".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }

        if self.retry.timeout.is_zero() {
            errors.push("retry.timeout must be greater than 0".to_string());
        }

        if self.services.is_empty() {
            errors.push("at least one service must be configured".to_string());
        }

        let mut inbound_paths = HashSet::new();
        for (index, service) in self.services.iter().enumerate() {
            if service.name.is_empty() {
                errors.push(format!("Service {} has empty name", index));
            }

            if !service.prefix.starts_with('/') {
                errors.push(format!(
                    "Service '{}' prefix must start with '/': {}",
                    service.name, service.prefix
                ));
            }

            if service.routes.is_empty() {
                errors.push(format!("Service '{}' has no routes", service.name));
            }

            for route in &service.routes {
                if route.name.is_empty() || route.name.contains('/') {
                    errors.push(format!(
                        "Service '{}' has invalid route name '{}'",
                        service.name, route.name
                    ));
                }

                if !route.path.starts_with('/') {
                    errors.push(format!(
                        "Route '{}' of service '{}' has path not starting with '/': {}",
                        route.name, service.name, route.path
                    ));
                }

                match route.method.to_uppercase().as_str() {
                    "GET" | "POST" | "PUT" | "DELETE" | "PATCH" => {}
                    _ => errors.push(format!(
                        "Route '{}' of service '{}' has invalid HTTP method: {}",
                        route.name, service.name, route.method
                    )),
                }

                let inbound = service.inbound_path(route);
                if !inbound_paths.insert(inbound.clone()) {
                    errors.push(format!("Duplicate inbound path: {}", inbound));
                }
            }
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.observability.logging.level)),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.observability.logging.format)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the boundary listener binds to
    pub listen_address: String,

    /// How long in-flight requests may run after a termination signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Largest inbound request body accepted, in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

/// Consul registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consul agent address (`host:port`, `:port` or a full URL)
    pub address: String,

    /// Consul datacenter
    pub datacenter: Option<String>,

    /// ACL token sent with every query
    pub token: Option<String>,

    /// Only report instances passing all health checks
    pub passing_only: bool,

    /// Maximum time a blocking query may be held open by the agent
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,

    /// First delay after a failed registry query
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Cap on the backoff between failed registry queries
    #[serde(with = "humantime_serde")]
    pub max_retry_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            datacenter: None,
            token: None,
            passing_only: true,
            wait_time: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(30),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Per-request attempts across different instances
    pub max_attempts: u32,

    /// Per-request timeout, including retries
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Settings for the HTTP client allocated per instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,

    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(250),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// One downstream service and the routes exposed for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name in the registry
    pub name: String,

    /// Tags every instance must carry
    #[serde(default)]
    pub tags: Vec<String>,

    /// Inbound path prefix, e.g. `/addsvc`
    pub prefix: String,

    pub routes: Vec<RouteConfig>,
}

impl ServiceConfig {
    /// Inbound path a route is mounted at: `<prefix>/<route name>`
    pub fn inbound_path(&self, route: &RouteConfig) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), route.name)
    }
}

/// One logical route: inbound name, outbound call shape and codec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Logical method name, also the last inbound path segment
    pub name: String,

    /// Outbound HTTP method
    #[serde(default = "default_route_method")]
    pub method: String,

    /// Outbound path on each instance
    pub path: String,

    /// Request/response codec for this method
    pub codec: CodecKind,
}

fn default_route_method() -> String {
    "POST".to_string()
}

fn route(name: &str, codec: CodecKind) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        method: default_route_method(),
        path: format!("/{}", name),
        codec,
    }
}

/// The route table of the stock deployment
pub fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig {
            name: "addsvc".to_string(),
            tags: Vec::new(),
            prefix: "/addsvc".to_string(),
            routes: vec![route("sum", CodecKind::Sum), route("concat", CodecKind::Concat)],
        },
        ServiceConfig {
            name: "addstring".to_string(),
            tags: Vec::new(),
            prefix: "/stringsvc".to_string(),
            routes: vec![
                route("uppercase", CodecKind::Uppercase),
                route("count", CodecKind::Count),
            ],
        },
    ]
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LogConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`; `RUST_LOG` takes precedence
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0:9000".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stock() -> GatewayConfig {
        GatewayConfig::default()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = stock();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.timeout, Duration::from_millis(500));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[1].name, "addstring");
        assert_eq!(
            config.services[1].inbound_path(&config.services[1].routes[0]),
            "/stringsvc/uppercase"
        );
    }

    #[test]
    fn test_empty_service_table_is_rejected() {
        let mut config = GatewayConfig::default();
        config.services.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one service"));
    }

    #[test]
    fn test_validation_reports_all_problems() {
        let mut config = stock();
        config.retry.max_attempts = 0;
        config.retry.timeout = Duration::ZERO;
        config.services[0].routes[0].path = "sum".to_string();
        config.services[0].routes[1].method = "FETCH".to_string();
        config.observability.logging.format = "xml".to_string();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_attempts"));
        assert!(message.contains("retry.timeout"));
        assert!(message.contains("not starting with '/'"));
        assert!(message.contains("invalid HTTP method"));
        assert!(message.contains("Invalid log format"));
    }

    #[test]
    fn test_duplicate_inbound_paths_are_rejected() {
        let mut config = stock();
        let duplicate = config.services[0].routes[0].clone();
        config.services[0].routes.push(duplicate);

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("Duplicate inbound path: /addsvc/sum"));
    }

    #[test]
    fn test_unknown_codec_fails_at_parse_time() {
        let yaml = r#"
services:
  - name: addsvc
    prefix: /addsvc
    routes:
      - name: multiply
        path: /multiply
        codec: multiply
"#;
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  listen_address: "127.0.0.1:8080"
  shutdown_timeout: "5s"
registry:
  address: "consul.internal:8500"
  wait_time: "10s"
retry:
  max_attempts: 5
  timeout: "750ms"
services:
  - name: addsvc
    prefix: /addsvc
    routes:
      - name: sum
        method: POST
        path: /sum
        codec: sum
"#;
        tokio::fs::write(&config_path, config_content).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:8080");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.address, "consul.internal:8500");
        assert_eq!(config.registry.wait_time, Duration::from_secs(10));
        assert!(config.registry.passing_only);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.timeout, Duration::from_millis(750));
        assert_eq!(config.services[0].routes[0].codec, CodecKind::Sum);
    }
}
