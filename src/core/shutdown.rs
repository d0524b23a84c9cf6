//! # Graceful Shutdown
//!
//! Shutdown runs in three phases, each driven by its own cancellation token:
//!
//! 1. **StopAccepting** - the listener stops taking new connections and drains.
//! 2. **AbortInFlight** - requests still running after the grace period are canceled;
//!    their retry loops return `Canceled`.
//! 3. **StopBackground** - instance watchers stop, endpoint pools release every
//!    per-instance resource, and the task tracker is drained.
//!
//! Tokens are level-triggered: a phase entered before anybody waits on it is still
//! observed by every later waiter, so a signal can never be lost.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};

/// Shutdown phase enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StopAccepting,
    AbortInFlight,
    StopBackground,
}

/// Owner of the process-wide shutdown signals and background tasks
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    stop_accepting: CancellationToken,
    abort_in_flight: CancellationToken,
    stop_background: CancellationToken,
    tracker: TaskTracker,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            abort_in_flight: CancellationToken::new(),
            stop_background: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace_period,
        }
    }

    /// Fires when the listener must stop accepting requests
    pub fn stop_accepting_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Token handed to each request; fires when in-flight work must be abandoned
    pub fn request_token(&self) -> CancellationToken {
        self.abort_in_flight.child_token()
    }

    /// Token for watcher and pool refresh loops
    pub fn background_token(&self) -> CancellationToken {
        self.stop_background.child_token()
    }

    /// Tracker every background task is spawned on
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Current phase, derived from which tokens have fired
    pub fn phase(&self) -> ShutdownPhase {
        if self.stop_background.is_cancelled() {
            ShutdownPhase::StopBackground
        } else if self.abort_in_flight.is_cancelled() {
            ShutdownPhase::AbortInFlight
        } else if self.stop_accepting.is_cancelled() {
            ShutdownPhase::StopAccepting
        } else {
            ShutdownPhase::Running
        }
    }

    /// Begin shutdown; safe to call more than once
    pub fn initiate(&self) {
        if !self.stop_accepting.is_cancelled() {
            info!("Initiating graceful shutdown");
        }
        self.stop_accepting.cancel();
    }

    /// Resolve once SIGINT or SIGTERM arrives, or once shutdown is initiated some other way
    pub async fn wait_for_signal(&self) -> GatewayResult<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())
                .map_err(|e| GatewayError::internal(format!("Failed to install SIGTERM handler: {}", e)))?;
            let mut sigint = signal(SignalKind::interrupt())
                .map_err(|e| GatewayError::internal(format!("Failed to install SIGINT handler: {}", e)))?;

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
                _ = self.stop_accepting.cancelled() => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.map_err(|e| GatewayError::internal(format!("Failed to listen for Ctrl+C: {}", e)))?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.stop_accepting.cancelled() => {}
            }
        }

        self.initiate();
        Ok(())
    }

    /// Run the remaining phases once the listener has been told to stop
    ///
    /// `drained` must resolve when every in-flight request has completed, typically
    /// the serve future itself. Returns `true` when draining finished within the
    /// grace period. After the abort, `drained` gets one more grace period at most.
    pub async fn complete<F>(&self, drained: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.initiate();
        tokio::pin!(drained);

        let graceful = match tokio::time::timeout(self.grace_period, &mut drained).await {
            Ok(()) => {
                info!("In-flight requests drained");
                true
            }
            Err(_) => {
                warn!(
                    grace_period_ms = self.grace_period.as_millis() as u64,
                    "Grace period elapsed, canceling remaining requests"
                );
                self.abort_in_flight.cancel();
                // Connections still reading a request body ignore the abort.
                if tokio::time::timeout(self.grace_period, &mut drained).await.is_err() {
                    warn!("Connections still open after abort, abandoning them");
                }
                false
            }
        };

        self.abort_in_flight.cancel();
        self.stop_background.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Background tasks stopped");

        graceful
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let shutdown = ShutdownCoordinator::new(Duration::from_millis(50));
        shutdown.initiate();

        // Waiting after the fact still resolves immediately.
        tokio::time::timeout(Duration::from_millis(100), shutdown.stop_accepting_token().cancelled())
            .await
            .unwrap();
        assert_eq!(shutdown.phase(), ShutdownPhase::StopAccepting);
    }

    #[tokio::test]
    async fn test_complete_drains_then_stops_background() {
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
        let stopped = Arc::new(AtomicBool::new(false));

        let token = shutdown.background_token();
        let flag = stopped.clone();
        shutdown.tracker().spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        let graceful = shutdown.complete(async {}).await;
        assert!(graceful);
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(shutdown.phase(), ShutdownPhase::StopBackground);
    }

    #[tokio::test]
    async fn test_slow_requests_are_aborted_after_grace_period() {
        let shutdown = ShutdownCoordinator::new(Duration::from_millis(20));
        let request = shutdown.request_token();

        let graceful = shutdown
            .complete(async move {
                request.cancelled().await;
            })
            .await;

        assert!(!graceful);
    }

    #[tokio::test]
    async fn test_stuck_connection_does_not_block_shutdown() {
        let shutdown = ShutdownCoordinator::new(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let graceful = shutdown.complete(std::future::pending::<()>()).await;

        assert!(!graceful);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(shutdown.phase(), ShutdownPhase::StopBackground);
    }
}
