//! # Error Handling Module
//!
//! Every failure the gateway can produce is a variant of [`GatewayError`]. The enum
//! mirrors the way failures travel through the routing layer:
//!
//! - `Discovery` and `Build` are absorbed where they happen (the watcher keeps its
//!   last good set, the pool skips the instance) and only ever reach a caller at startup.
//! - `NoEndpoints`, `RetryExhausted` and `Canceled` are the three ways a routed call can
//!   fail and are always returned to the route binding.
//! - `Transport` is the per-attempt failure that drives the retry loop.
//!
//! The boundary listener turns errors into HTTP responses through [`IntoResponse`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the edge gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, unknown routes)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Registry unreachable or returned something we could not understand
    #[error("Service discovery error for '{service}': {message}")]
    Discovery { service: String, message: String },

    /// One instance's endpoint could not be constructed
    #[error("Failed to build endpoint for instance '{instance}': {message}")]
    Build { instance: String, message: String },

    /// The pool had nothing to select from
    #[error("No endpoints available for service '{service}'")]
    NoEndpoints { service: String },

    /// A single invocation attempt failed
    #[error("Transport error calling '{instance}': {message}")]
    Transport { instance: String, message: String },

    /// Every attempt failed or the budget ran out between attempts
    #[error("Retry budget exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },

    /// The governing deadline expired or the call was canceled mid-attempt
    #[error("Request canceled after {attempts} attempt(s): {reason}")]
    Canceled { attempts: u32, reason: String },

    /// Malformed payload on either side of a route codec
    #[error("Codec error ({route}): {message}")]
    Codec { route: String, message: String },

    /// A healthy instance answered, but with a domain-level error
    #[error("Downstream error ({route}): {message}")]
    Downstream { route: String, message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, socket binding, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a discovery error for a service
    pub fn discovery<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Discovery {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create an endpoint build error for an instance
    pub fn build<S: Into<String>, M: Into<String>>(instance: S, message: M) -> Self {
        Self::Build {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Create a transport error for an instance
    pub fn transport<S: Into<String>, M: Into<String>>(instance: S, message: M) -> Self {
        Self::Transport {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Create an empty-pool error
    pub fn no_endpoints<S: Into<String>>(service: S) -> Self {
        Self::NoEndpoints {
            service: service.into(),
        }
    }

    /// Create a cancellation error
    pub fn canceled<S: Into<String>>(attempts: u32, reason: S) -> Self {
        Self::Canceled {
            attempts,
            reason: reason.into(),
        }
    }

    /// Create a codec error for a route
    pub fn codec<S: Into<String>, M: Into<String>>(route: S, message: M) -> Self {
        Self::Codec {
            route: route.into(),
            message: message.into(),
        }
    }

    /// Create a downstream domain error for a route
    pub fn downstream<S: Into<String>, M: Into<String>>(route: S, message: M) -> Self {
        Self::Downstream {
            route: route.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoEndpoints { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RetryExhausted { .. } => StatusCode::BAD_GATEWAY,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Canceled { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Codec { .. } => StatusCode::BAD_REQUEST,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Downstream { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Discovery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Build { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error should trigger another attempt against a different instance
    ///
    /// Only transport failures qualify. Codec and downstream errors are deterministic:
    /// asking another instance would produce the same answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Discovery { .. } => "discovery_error",
            Self::Build { .. } => "build_error",
            Self::NoEndpoints { .. } => "no_endpoints",
            Self::Transport { .. } => "transport_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Canceled { .. } => "canceled",
            Self::Codec { .. } => "codec_error",
            Self::Downstream { .. } => "downstream_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Structured error body so clients can tell a drained pool from an exhausted budget
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(GatewayError::transport("10.0.0.1:8080", "connection refused").is_retryable());
        assert!(!GatewayError::no_endpoints("addsvc").is_retryable());
        assert!(!GatewayError::codec("sum", "missing field `a`").is_retryable());
        assert!(!GatewayError::downstream("sum", "overflow").is_retryable());
        assert!(!GatewayError::canceled(1, "deadline exceeded").is_retryable());
    }

    #[test]
    fn test_retry_exhausted_wraps_last_error() {
        let last = GatewayError::transport("10.0.0.3:8080", "status 500");
        let err = GatewayError::RetryExhausted {
            attempts: 3,
            last: Box::new(last.clone()),
        };

        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("3 attempt(s)"));
        assert_eq!(err.source().map(|e| e.to_string()), Some(last.to_string()));
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            GatewayError::no_endpoints("addsvc").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::canceled(1, "deadline").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::codec("count", "bad json").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::config("bad").error_type(), "configuration_error");
    }
}
