//! Gateway assembly: wiring of the routing graph and the boundary listener.

pub mod server;
pub mod wiring;

pub use server::GatewayServer;
pub use wiring::Gateway;
