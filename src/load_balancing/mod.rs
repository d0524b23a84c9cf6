pub mod balancer;
pub mod retry;

pub use balancer::{Balancer, BalancerStats, RoundRobin};
pub use retry::RetryOrchestrator;
