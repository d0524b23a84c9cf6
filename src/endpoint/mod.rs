//! Endpoint construction and the per-route pools that hold them.

pub mod factory;
pub mod pool;

pub use factory::{Closer, Endpoint, EndpointFactory, HttpEndpointFactory};
pub use pool::{EndpointPool, EndpointRecord, PoolSnapshot};
