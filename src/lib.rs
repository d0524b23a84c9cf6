//! # Edge Gateway Library
//!
//! An edge API gateway that exposes a fixed set of logical methods over HTTP and
//! routes each call to a live instance of the backing service. Instances come from a
//! service registry (Consul), are load-balanced round-robin, and failed calls are
//! retried on other instances within a bounded attempt count and deadline.
//!
//! ## Request Path
//!
//! ```text
//! GatewayServer ─> RouteBinding ─> RetryOrchestrator ─> RoundRobin ─> EndpointPool snapshot
//!                                          │
//!                                          └─> Endpoint::call (one attempt)
//! ```
//!
//! The pool is kept current by an `InstanceWatcher` running in the background; the
//! request path only ever reads immutable snapshots.

/// Error types, configuration, shared data types and shutdown coordination
pub mod core;

/// Gateway wiring and the HTTP boundary listener
pub mod gateway;

/// Endpoint construction and per-route endpoint pools
pub mod endpoint;

/// Round-robin selection and the retry orchestrator
pub mod load_balancing;

/// Registry clients and the background instance watcher
pub mod discovery;

/// Route descriptors, codecs and route bindings
pub mod routing;

/// Structured logging and Prometheus metrics
pub mod observability;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::shutdown::ShutdownCoordinator;
pub use crate::gateway::{Gateway, GatewayServer};
