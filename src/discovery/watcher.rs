//! # Instance Watcher
//!
//! Keeps the healthy instance set of one service up to date. The initial fetch happens
//! inline so startup can fail loudly; afterwards a background task issues blocking
//! queries and publishes every change through a `tokio::sync::watch` channel.
//!
//! A failed query never clears the published set. The watcher logs, backs off
//! exponentially (capped at `max_retry_interval`, which bounds staleness once the
//! registry is back) and keeps serving the last known-good instances.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::config::RegistryConfig;
use crate::core::error::GatewayResult;
use crate::core::types::{InstanceSet, ServiceName};
use crate::discovery::registry::{InstanceQuery, QueryOptions, RegistryClient};
use crate::observability::metrics::{DISCOVERY_ERRORS, DISCOVERY_INSTANCES, DISCOVERY_REFRESHES};

/// Timing knobs for one watcher
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub tags: Vec<String>,
    pub wait_time: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl WatchSettings {
    pub fn from_config(config: &RegistryConfig, tags: Vec<String>) -> Self {
        Self {
            tags,
            wait_time: config.wait_time,
            retry_interval: config.retry_interval,
            max_retry_interval: config.max_retry_interval,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default(), Vec::new())
    }
}

/// Latest healthy instance set of one service, refreshed in the background
#[derive(Clone)]
pub struct InstanceWatcher {
    service: ServiceName,
    receiver: watch::Receiver<InstanceSet>,
}

impl InstanceWatcher {
    /// Fetch the initial set and spawn the refresh loop on `tracker`
    ///
    /// Fails with a discovery error when the initial fetch fails: without a first
    /// known-good set there is nothing to serve.
    pub async fn start(
        client: Arc<dyn RegistryClient>,
        service: ServiceName,
        settings: WatchSettings,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> GatewayResult<Self> {
        let options = QueryOptions {
            tags: settings.tags.clone(),
            ..Default::default()
        };
        let initial = client.healthy_instances(&service, &options).await?;

        info!(
            service = %service,
            instances = initial.instances.len(),
            "Initial instance set fetched"
        );
        metrics::gauge!(DISCOVERY_INSTANCES, "service" => service.to_string())
            .set(initial.instances.len() as f64);

        let (sender, receiver) = watch::channel(Arc::new(initial.instances.clone()));

        let refresh = RefreshLoop {
            client,
            service: service.clone(),
            settings,
            sender,
            cancel,
        };
        tracker.spawn(refresh.run(initial));

        Ok(Self { service, receiver })
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Latest known-good instance set
    pub fn instances(&self) -> InstanceSet {
        self.receiver.borrow().clone()
    }

    /// Receiver notified on every change; closes when the refresh loop stops
    pub fn subscribe(&self) -> watch::Receiver<InstanceSet> {
        self.receiver.clone()
    }
}

struct RefreshLoop {
    client: Arc<dyn RegistryClient>,
    service: ServiceName,
    settings: WatchSettings,
    sender: watch::Sender<InstanceSet>,
    cancel: CancellationToken,
}

impl RefreshLoop {
    async fn run(self, initial: InstanceQuery) {
        let mut index = initial.index.max(1);
        let mut backoff = self.settings.retry_interval;

        loop {
            let options = QueryOptions {
                tags: self.settings.tags.clone(),
                index: Some(index),
                wait: Some(self.settings.wait_time),
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.client.healthy_instances(&self.service, &options) => result,
            };

            match result {
                Ok(query) => {
                    backoff = self.settings.retry_interval;
                    metrics::counter!(DISCOVERY_REFRESHES, "service" => self.service.to_string())
                        .increment(1);

                    // An index of 0 never blocks, and one moving backwards means the
                    // registry was reset; both restart from 1.
                    let advanced = query.index > index;
                    index = if query.index < index { 1 } else { query.index.max(1) };
                    self.publish(query);

                    if self.sender.is_closed() {
                        debug!(service = %self.service, "No subscribers left for instance updates");
                        break;
                    }

                    if !advanced {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.settings.retry_interval) => {}
                        }
                    }
                }
                Err(e) => {
                    metrics::counter!(DISCOVERY_ERRORS, "service" => self.service.to_string())
                        .increment(1);
                    warn!(
                        service = %self.service,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Registry query failed, serving last known instances"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.max_retry_interval);
                }
            }
        }

        debug!(service = %self.service, "Instance watcher stopped");
    }

    fn publish(&self, query: InstanceQuery) {
        let changed = self.sender.send_if_modified(|current| {
            if current.as_slice() == query.instances.as_slice() {
                false
            } else {
                *current = Arc::new(query.instances.clone());
                true
            }
        });

        if changed {
            info!(
                service = %self.service,
                instances = query.instances.len(),
                index = query.index,
                "Instance set changed"
            );
            metrics::gauge!(DISCOVERY_INSTANCES, "service" => self.service.to_string())
                .set(query.instances.len() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Instance;
    use crate::discovery::registry::StaticRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_settings() -> WatchSettings {
        WatchSettings {
            tags: Vec::new(),
            wait_time: Duration::from_millis(200),
            retry_interval: Duration::from_millis(10),
            max_retry_interval: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_is_fatal() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_available(false);

        let result = InstanceWatcher::start(
            registry,
            ServiceName::new("addsvc"),
            fast_settings(),
            CancellationToken::new(),
            &TaskTracker::new(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_watcher_publishes_changes() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_instances("addsvc", ["10.0.0.1:80"]);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let watcher = InstanceWatcher::start(
            registry.clone(),
            ServiceName::new("addsvc"),
            fast_settings(),
            cancel.clone(),
            &tracker,
        )
        .await
        .unwrap();
        assert_eq!(watcher.instances().as_slice(), &[Instance::from("10.0.0.1:80")]);

        let mut updates = watcher.subscribe();
        registry.set_instances("addsvc", ["10.0.0.1:80", "10.0.0.2:80"]);

        tokio::time::timeout(Duration::from_secs(1), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.instances().len(), 2);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    /// Answers at once with index 0, like an agent that sends no `X-Consul-Index`
    #[derive(Default)]
    struct UnindexedRegistry {
        queries: AtomicUsize,
        indexes: parking_lot::Mutex<Vec<Option<u64>>>,
    }

    #[async_trait]
    impl RegistryClient for UnindexedRegistry {
        async fn healthy_instances(
            &self,
            _service: &ServiceName,
            options: &QueryOptions,
        ) -> GatewayResult<InstanceQuery> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.indexes.lock().push(options.index);
            Ok(InstanceQuery {
                instances: vec![Instance::from("10.0.0.1:80")],
                index: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_unindexed_registry_is_polled_at_retry_interval() {
        let registry = Arc::new(UnindexedRegistry::default());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let watcher = InstanceWatcher::start(
            registry.clone(),
            ServiceName::new("addsvc"),
            fast_settings(),
            cancel.clone(),
            &tracker,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        // One initial fetch plus roughly one query per 10ms retry interval.
        let queries = registry.queries.load(Ordering::SeqCst);
        assert!(queries >= 2, "{queries}");
        assert!(queries <= 20, "{queries}");
        assert!(registry.indexes.lock()[1..].iter().all(|index| *index == Some(1)));
        assert_eq!(watcher.instances().len(), 1);
    }

    #[tokio::test]
    async fn test_outage_keeps_last_known_set() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_instances("addsvc", ["10.0.0.1:80"]);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let watcher = InstanceWatcher::start(
            registry.clone(),
            ServiceName::new("addsvc"),
            fast_settings(),
            cancel.clone(),
            &tracker,
        )
        .await
        .unwrap();

        registry.set_available(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(watcher.instances().as_slice(), &[Instance::from("10.0.0.1:80")]);

        // Recovery is picked up within the backoff cap.
        let mut updates = watcher.subscribe();
        registry.set_instances("addsvc", ["10.0.0.9:80"]);
        registry.set_available(true);
        tokio::time::timeout(Duration::from_secs(1), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.instances().as_slice(), &[Instance::from("10.0.0.9:80")]);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
