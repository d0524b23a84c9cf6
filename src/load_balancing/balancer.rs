//! # Load Balancer Module
//!
//! Picks one endpoint out of a pool snapshot for each attempt of a routed call.
//!
//! ## Round Robin
//!
//! The cursor is a single `AtomicUsize` advanced with a wrapping `fetch_add`. The
//! selected index is `cursor % len` of whatever snapshot the caller passes in, so
//! the cursor is never reset when the pool publishes a new snapshot and distribution
//! stays even across instance churn.
//!
//! Per-instance selection counts live in a `DashMap` so the health endpoint can
//! report them without taking a lock on the request path. Counts are kept only for
//! instances still in the pool.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Instance;
use crate::endpoint::pool::{EndpointPool, EndpointRecord, PoolSnapshot};
use crate::observability::metrics::{BALANCER_EMPTY, BALANCER_SELECTIONS};

/// Core trait for load balancing algorithms
pub trait Balancer: Send + Sync {
    /// Select a record from `snapshot`; `None` only when the snapshot is empty
    fn select(&self, snapshot: &PoolSnapshot) -> Option<Arc<EndpointRecord>>;

    /// Select from the pool's current snapshot
    ///
    /// An empty pool fails with [`GatewayError::NoEndpoints`] right away.
    fn endpoint(&self) -> GatewayResult<Arc<EndpointRecord>>;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Get current statistics for this load balancer
    fn stats(&self) -> BalancerStats;
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub algorithm: &'static str,
    pub total_selections: u64,
    pub failed_selections: u64,
    pub instance_selections: BTreeMap<String, u64>,
}

/// Round-robin load balancer over one endpoint pool
pub struct RoundRobin {
    pool: Arc<EndpointPool>,
    cursor: AtomicUsize,
    selections: DashMap<Instance, u64>,
    total_selections: AtomicU64,
    failed_selections: AtomicU64,
}

impl RoundRobin {
    /// Create a new round-robin load balancer
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            cursor: AtomicUsize::new(0),
            selections: DashMap::new(),
            total_selections: AtomicU64::new(0),
            failed_selections: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }
}

impl Balancer for RoundRobin {
    fn select(&self, snapshot: &PoolSnapshot) -> Option<Arc<EndpointRecord>> {
        if snapshot.is_empty() {
            return None;
        }

        // fetch_add wraps on overflow, and the modulo keeps the index in range.
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        let record = snapshot.get(index)?.clone();

        self.total_selections.fetch_add(1, Ordering::Relaxed);
        if !self.selections.contains_key(&record.instance) {
            // First pick of an instance; forget the ones that left the pool.
            self.selections.retain(|instance, _| snapshot.contains(instance));
        }
        *self.selections.entry(record.instance.clone()).or_insert(0) += 1;

        Some(record)
    }

    fn endpoint(&self) -> GatewayResult<Arc<EndpointRecord>> {
        let route = self.pool.route();
        let snapshot = self.pool.current();

        match self.select(&snapshot) {
            Some(record) => {
                metrics::counter!(BALANCER_SELECTIONS, "route" => route.label()).increment(1);
                debug!(
                    route = %route.label(),
                    instance = %record.instance,
                    algorithm = self.algorithm_name(),
                    "Selected endpoint"
                );
                Ok(record)
            }
            None => {
                self.failed_selections.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(BALANCER_EMPTY, "route" => route.label()).increment(1);
                Err(GatewayError::no_endpoints(route.service.as_str()))
            }
        }
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }

    fn stats(&self) -> BalancerStats {
        let snapshot = self.pool.current();
        self.selections.retain(|instance, _| snapshot.contains(instance));

        BalancerStats {
            algorithm: self.algorithm_name(),
            total_selections: self.total_selections.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            instance_selections: self
                .selections
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        }
    }
}
