//! # Endpoint Pool
//!
//! The live set of endpoints for one route of one service. Readers get an immutable
//! [`PoolSnapshot`] through a lock-free `ArcSwap` load; the refresh path diffs the
//! watcher's instance set against the endpoints it already has, builds the new ones,
//! publishes a fresh snapshot and then releases the endpoints that went away.
//!
//! ## Concurrency
//!
//! - Snapshots are never mutated after publication, so a retry loop holding one can
//!   keep using it while a refresh runs.
//! - The `parking_lot::Mutex` guards only the builder state and is never touched by
//!   `current()`. Endpoints are built outside it, and watcher-driven refreshes run on
//!   the blocking pool since building a client may load TLS roots.
//! - Each closer is taken out of the map before it runs, so it runs at most once;
//!   `close()` and `Drop` guarantee it runs at least once.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::types::Instance;
use crate::discovery::watcher::InstanceWatcher;
use crate::endpoint::factory::{Closer, Endpoint, EndpointFactory};
use crate::observability::metrics::{POOL_BUILD_ERRORS, POOL_ENDPOINTS};
use crate::routing::descriptor::RouteDescriptor;

/// One instance bound to one route
pub struct EndpointRecord {
    pub instance: Instance,
    pub endpoint: Arc<dyn Endpoint>,
}

impl EndpointRecord {
    pub fn new(instance: Instance, endpoint: Arc<dyn Endpoint>) -> Self {
        Self { instance, endpoint }
    }
}

impl fmt::Debug for EndpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRecord")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Immutable, ordered set of endpoint records at one point in time
#[derive(Debug, Default)]
pub struct PoolSnapshot {
    records: Vec<Arc<EndpointRecord>>,
}

impl PoolSnapshot {
    /// Records for duplicate instances are dropped, keeping the first
    pub fn new(records: Vec<Arc<EndpointRecord>>) -> Self {
        let mut seen = HashSet::new();
        let records = records
            .into_iter()
            .filter(|record| seen.insert(record.instance.clone()))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<EndpointRecord>> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointRecord>> {
        self.records.iter()
    }

    pub fn contains(&self, instance: &Instance) -> bool {
        self.records.iter().any(|record| &record.instance == instance)
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.records.iter().map(|record| record.instance.clone()).collect()
    }
}

struct LiveEndpoint {
    record: Arc<EndpointRecord>,
    closer: Option<Closer>,
}

impl LiveEndpoint {
    fn release(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

/// Continuously refreshed endpoints for one (service, route) pair
pub struct EndpointPool {
    route: Arc<RouteDescriptor>,
    factory: Arc<dyn EndpointFactory>,
    snapshot: ArcSwap<PoolSnapshot>,
    live: Mutex<HashMap<Instance, LiveEndpoint>>,
    refreshing: Mutex<()>,
}

impl EndpointPool {
    /// Empty pool; call [`refresh`](Self::refresh) or use [`spawn`](Self::spawn)
    pub fn new(route: Arc<RouteDescriptor>, factory: Arc<dyn EndpointFactory>) -> Self {
        Self {
            route,
            factory,
            snapshot: ArcSwap::from_pointee(PoolSnapshot::default()),
            live: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(()),
        }
    }

    /// Build the pool from the watcher's current set and keep it in sync in the background
    ///
    /// The refresh task stops when `cancel` fires or the watcher goes away, and
    /// releases every endpoint on its way out.
    pub fn spawn(
        route: Arc<RouteDescriptor>,
        factory: Arc<dyn EndpointFactory>,
        watcher: &InstanceWatcher,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let pool = Arc::new(Self::new(route, factory));

        let mut updates = watcher.subscribe();
        let initial = updates.borrow_and_update().clone();
        pool.refresh(&initial);

        let task_pool = pool.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let instances = updates.borrow_and_update().clone();
                        let pool = task_pool.clone();
                        let refreshed = tokio::task::spawn_blocking(move || pool.refresh(&instances)).await;
                        if let Err(e) = refreshed {
                            warn!(route = %task_pool.route.label(), error = %e, "Pool refresh task failed");
                        }
                    }
                }
            }
            task_pool.close();
        });

        pool
    }

    pub fn route(&self) -> &Arc<RouteDescriptor> {
        &self.route
    }

    /// Latest published snapshot; never blocks
    pub fn current(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Reconcile the pool with `instances` and publish a new snapshot
    ///
    /// Endpoints are built without holding the live-set lock; refreshes and
    /// `close` are serialized against each other.
    pub fn refresh(&self, instances: &[Instance]) {
        let _refreshing = self.refreshing.lock();

        let missing: Vec<&Instance> = {
            let live = self.live.lock();
            let mut seen = HashSet::new();
            instances
                .iter()
                .filter(|instance| !live.contains_key(*instance) && seen.insert(*instance))
                .collect()
        };
        let built: Vec<(Instance, LiveEndpoint)> = missing
            .into_iter()
            .filter_map(|instance| self.build(instance))
            .collect();

        let wanted: HashSet<&Instance> = instances.iter().collect();
        let (removed, size) = {
            let mut live = self.live.lock();
            let gone: Vec<Instance> = live
                .keys()
                .filter(|instance| !wanted.contains(instance))
                .cloned()
                .collect();
            let removed: Vec<LiveEndpoint> =
                gone.iter().filter_map(|instance| live.remove(instance)).collect();
            live.extend(built);

            let records = instances
                .iter()
                .filter_map(|instance| live.get(instance).map(|entry| entry.record.clone()))
                .collect();
            let snapshot = PoolSnapshot::new(records);
            let size = snapshot.len();
            self.snapshot.store(Arc::new(snapshot));
            (removed, size)
        };
        metrics::gauge!(POOL_ENDPOINTS, "route" => self.route.label()).set(size as f64);

        // Release only after readers can no longer pick the removed endpoints up.
        for mut entry in removed {
            info!(
                route = %self.route.label(),
                instance = %entry.record.instance,
                "Endpoint removed from pool"
            );
            entry.release();
        }

        debug!(route = %self.route.label(), endpoints = size, "Pool snapshot published");
    }

    fn build(&self, instance: &Instance) -> Option<(Instance, LiveEndpoint)> {
        match self.factory.build(instance, &self.route) {
            Ok((endpoint, closer)) => {
                debug!(route = %self.route.label(), instance = %instance, "Endpoint built");
                let entry = LiveEndpoint {
                    record: Arc::new(EndpointRecord::new(instance.clone(), endpoint)),
                    closer: Some(closer),
                };
                Some((instance.clone(), entry))
            }
            Err(e) => {
                metrics::counter!(POOL_BUILD_ERRORS, "route" => self.route.label()).increment(1);
                warn!(
                    route = %self.route.label(),
                    instance = %instance,
                    error = %e,
                    "Excluding instance whose endpoint could not be built"
                );
                None
            }
        }
    }

    /// Publish an empty snapshot and release every endpoint
    pub fn close(&self) {
        let _refreshing = self.refreshing.lock();
        let drained: Vec<LiveEndpoint> = {
            let mut live = self.live.lock();
            self.snapshot.store(Arc::new(PoolSnapshot::default()));
            live.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for mut entry in drained {
            entry.release();
        }

        if count > 0 {
            info!(route = %self.route.label(), released = count, "Endpoint pool closed");
        }
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        for (_, mut entry) in self.live.get_mut().drain() {
            entry.release();
        }
    }
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("route", &self.route.label())
            .field("endpoints", &self.current().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{GatewayError, GatewayResult};
    use crate::core::types::ServiceName;
    use crate::routing::codec::CodecKind;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use tokio::time::Instant;

    struct Echo;

    #[async_trait]
    impl Endpoint for Echo {
        async fn call(&self, request: &Value, _deadline: Instant) -> GatewayResult<Value> {
            Ok(request.clone())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl EndpointFactory for CountingFactory {
        fn build(
            &self,
            instance: &Instance,
            _route: &RouteDescriptor,
        ) -> GatewayResult<(Arc<dyn Endpoint>, Closer)> {
            if instance.address().starts_with("bad") {
                return Err(GatewayError::build(instance.address(), "rejected"));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            let closed = self.closed.clone();
            let closer: Closer = Box::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
            Ok((Arc::new(Echo) as Arc<dyn Endpoint>, closer))
        }
    }

    /// Records whether the pool's live set was unlocked at each build
    #[derive(Default)]
    struct LockCheckingFactory {
        pool: OnceLock<Weak<EndpointPool>>,
        unlocked: Mutex<Vec<bool>>,
    }

    impl EndpointFactory for LockCheckingFactory {
        fn build(
            &self,
            _instance: &Instance,
            _route: &RouteDescriptor,
        ) -> GatewayResult<(Arc<dyn Endpoint>, Closer)> {
            if let Some(pool) = self.pool.get().and_then(Weak::upgrade) {
                let unlocked = pool.live.try_lock().is_some();
                self.unlocked.lock().push(unlocked);
            }
            Ok((Arc::new(Echo) as Arc<dyn Endpoint>, crate::endpoint::factory::noop_closer()))
        }
    }

    fn route() -> Arc<RouteDescriptor> {
        Arc::new(RouteDescriptor::new(
            ServiceName::new("addsvc"),
            "sum",
            Method::POST,
            "/sum",
            CodecKind::Sum,
        ))
    }

    fn instances(addresses: &[&str]) -> Vec<Instance> {
        addresses.iter().map(|a| Instance::from(*a)).collect()
    }

    #[test]
    fn test_refresh_reuses_existing_endpoints() {
        let factory = Arc::new(CountingFactory::default());
        let pool = EndpointPool::new(route(), factory.clone());

        pool.refresh(&instances(&["a:80", "b:80"]));
        pool.refresh(&instances(&["a:80", "b:80", "c:80"]));

        assert_eq!(factory.built.load(Ordering::SeqCst), 3);
        assert_eq!(pool.current().instances(), instances(&["a:80", "b:80", "c:80"]));
    }

    #[test]
    fn test_removed_instances_are_closed_once() {
        let factory = Arc::new(CountingFactory::default());
        let pool = EndpointPool::new(route(), factory.clone());

        pool.refresh(&instances(&["a:80", "b:80"]));
        let before = pool.current();
        pool.refresh(&instances(&["a:80", "c:80"]));
        pool.refresh(&instances(&["a:80", "c:80"]));

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(before.instances(), instances(&["a:80", "b:80"]));
        assert_eq!(pool.current().instances(), instances(&["a:80", "c:80"]));

        drop(pool);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_build_failures_are_excluded() {
        let factory = Arc::new(CountingFactory::default());
        let pool = EndpointPool::new(route(), factory);

        pool.refresh(&instances(&["a:80", "bad:80", "b:80"]));

        assert_eq!(pool.current().instances(), instances(&["a:80", "b:80"]));
    }

    #[test]
    fn test_close_empties_the_pool() {
        let factory = Arc::new(CountingFactory::default());
        let pool = EndpointPool::new(route(), factory.clone());

        pool.refresh(&instances(&["a:80", "b:80"]));
        pool.close();
        pool.close();

        assert!(pool.current().is_empty());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_endpoints_are_built_outside_the_live_lock() {
        let factory = Arc::new(LockCheckingFactory::default());
        let pool = Arc::new(EndpointPool::new(route(), factory.clone()));
        factory.pool.set(Arc::downgrade(&pool)).unwrap();

        pool.refresh(&instances(&["a:80", "b:80"]));

        assert_eq!(factory.unlocked.lock().as_slice(), [true, true]);
        assert_eq!(pool.current().len(), 2);
    }
}
