//! # Retry Orchestrator
//!
//! Runs one routed call as a sequence of attempts against balancer-selected endpoints,
//! bounded by both an attempt count and a wall-clock deadline.
//!
//! ## Loop
//!
//! 1. Bail out if the call was canceled or the deadline already passed.
//! 2. Ask the balancer for an endpoint from the pool's *current* snapshot, so instance
//!    churn during a long retry sequence is picked up. An empty pool ends the call
//!    with `NoEndpoints` without counting an attempt.
//! 3. Invoke it with the remaining budget as the attempt's deadline.
//! 4. Success ends the loop. Transport failures loop again while attempts remain;
//!    anything else is returned as is.
//!
//! Attempts are strictly sequential; a call is never sent to two instances at once.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{CallContext, RetryPolicy};
use crate::load_balancing::balancer::Balancer;
use crate::observability::metrics::{RETRY_ATTEMPTS, RETRY_CANCELED, RETRY_EXHAUSTED};

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Bounded retry across the instances behind one balancer
pub struct RetryOrchestrator {
    balancer: Arc<dyn Balancer>,
    policy: RetryPolicy,
    label: String,
}

impl RetryOrchestrator {
    pub fn new(balancer: Arc<dyn Balancer>, policy: RetryPolicy, label: impl Into<String>) -> Self {
        Self {
            balancer,
            policy,
            label: label.into(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.balancer
    }

    /// Invoke under the policy's own timeout budget
    pub async fn invoke(&self, request: &Value) -> GatewayResult<Value> {
        self.invoke_with(request, CallContext::with_budget(self.policy.timeout))
            .await
    }

    /// Invoke under the tighter of the caller's deadline and the policy budget
    pub async fn invoke_with(&self, request: &Value, ctx: CallContext) -> GatewayResult<Value> {
        let started = Instant::now();
        let deadline = ctx.deadline.min(started + self.policy.timeout);
        let mut attempts: u32 = 0;
        let mut last_error: Option<GatewayError> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(self.canceled(attempts, "call aborted"));
            }

            if Instant::now() >= deadline {
                return Err(match last_error {
                    Some(last) => self.exhausted(attempts, last, started),
                    None => self.canceled(attempts, DEADLINE_EXCEEDED),
                });
            }

            let record = self.balancer.endpoint()?;
            attempts += 1;
            metrics::counter!(RETRY_ATTEMPTS, "route" => self.label.clone()).increment(1);

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    return Err(self.canceled(attempts, "call aborted"));
                }
                outcome = tokio::time::timeout_at(deadline, record.endpoint.call(request, deadline)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(response)) => {
                    debug!(
                        route = %self.label,
                        instance = %record.instance,
                        attempt = attempts,
                        "Call succeeded"
                    );
                    return Ok(response);
                }
                Ok(Err(error)) => error,
                Err(_elapsed) => return Err(self.canceled(attempts, DEADLINE_EXCEEDED)),
            };

            if !error.is_retryable() {
                debug!(
                    route = %self.label,
                    instance = %record.instance,
                    attempt = attempts,
                    error = %error,
                    "Call failed with a non-retryable error"
                );
                return Err(error);
            }

            // A transport timeout that lands on the deadline is the deadline firing.
            if Instant::now() >= deadline {
                return Err(self.canceled(attempts, DEADLINE_EXCEEDED));
            }

            warn!(
                route = %self.label,
                instance = %record.instance,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                error = %error,
                "Attempt failed"
            );

            if attempts >= self.policy.max_attempts {
                return Err(self.exhausted(attempts, error, started));
            }
            last_error = Some(error);
        }
    }

    fn exhausted(&self, attempts: u32, last: GatewayError, started: Instant) -> GatewayError {
        metrics::counter!(RETRY_EXHAUSTED, "route" => self.label.clone()).increment(1);
        warn!(
            route = %self.label,
            attempts,
            elapsed_ms = elapsed_ms(started.elapsed()),
            "Retry budget exhausted"
        );
        GatewayError::RetryExhausted {
            attempts,
            last: Box::new(last),
        }
    }

    fn canceled(&self, attempts: u32, reason: &str) -> GatewayError {
        metrics::counter!(RETRY_CANCELED, "route" => self.label.clone()).increment(1);
        debug!(route = %self.label, attempts, reason, "Call canceled");
        GatewayError::canceled(attempts, reason)
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Instance, ServiceName};
    use crate::endpoint::factory::{noop_closer, Closer, Endpoint, EndpointFactory};
    use crate::endpoint::pool::EndpointPool;
    use crate::load_balancing::balancer::RoundRobin;
    use crate::routing::codec::CodecKind;
    use crate::routing::descriptor::RouteDescriptor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::Method;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Fail,
        Reject,
        Hang,
        FailAtDeadline,
    }

    struct Scripted {
        instance: Instance,
        behavior: Behavior,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Endpoint for Scripted {
        async fn call(&self, request: &Value, deadline: Instant) -> GatewayResult<Value> {
            self.calls.lock().push(self.instance.to_string());
            match self.behavior {
                Behavior::Ok => Ok(json!({"v": request["a"], "from": self.instance.address()})),
                Behavior::Fail => Err(GatewayError::transport(self.instance.address(), "refused")),
                Behavior::Reject => Err(GatewayError::downstream("sum", "overflow")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                Behavior::FailAtDeadline => {
                    tokio::time::sleep_until(deadline).await;
                    Err(GatewayError::transport(self.instance.address(), "timed out"))
                }
            }
        }
    }

    struct ScriptedFactory {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl EndpointFactory for ScriptedFactory {
        fn build(
            &self,
            instance: &Instance,
            _route: &RouteDescriptor,
        ) -> GatewayResult<(Arc<dyn Endpoint>, Closer)> {
            let behavior = match instance.address().split(':').next() {
                Some("ok") => Behavior::Ok,
                Some("reject") => Behavior::Reject,
                Some("hang") => Behavior::Hang,
                Some("late") => Behavior::FailAtDeadline,
                _ => Behavior::Fail,
            };
            let endpoint = Scripted {
                instance: instance.clone(),
                behavior,
                calls: self.calls.clone(),
            };
            Ok((Arc::new(endpoint) as Arc<dyn Endpoint>, noop_closer()))
        }
    }

    fn orchestrator(
        addresses: &[&str],
        policy: RetryPolicy,
    ) -> (RetryOrchestrator, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let route = Arc::new(RouteDescriptor::new(
            ServiceName::new("addsvc"),
            "sum",
            Method::POST,
            "/sum",
            CodecKind::Sum,
        ));
        let pool = Arc::new(EndpointPool::new(
            route,
            Arc::new(ScriptedFactory { calls: calls.clone() }),
        ));
        let instances: Vec<Instance> = addresses.iter().map(|a| Instance::from(*a)).collect();
        pool.refresh(&instances);

        let balancer = Arc::new(RoundRobin::new(pool));
        (RetryOrchestrator::new(balancer, policy, "addsvc.sum"), calls)
    }

    #[tokio::test]
    async fn test_fails_over_to_next_instance() {
        let (orchestrator, calls) = orchestrator(&["down:1", "ok:1"], RetryPolicy::default());

        let response = orchestrator.invoke(&json!({"a": 4, "b": 5})).await.unwrap();

        assert_eq!(response["from"], "ok:1");
        assert_eq!(calls.lock().as_slice(), ["down:1", "ok:1"]);
    }

    #[tokio::test]
    async fn test_exactly_max_attempts_then_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let (orchestrator, calls) = orchestrator(&["a:1", "b:1", "c:1", "d:1"], policy);

        let err = orchestrator.invoke(&json!({"a": 1, "b": 2})).await.unwrap_err();

        assert_eq!(calls.lock().as_slice(), ["a:1", "b:1", "c:1"]);
        match err {
            GatewayError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, GatewayError::Transport { ref instance, .. } if instance == "c:1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_fails_without_attempts() {
        let (orchestrator, calls) = orchestrator(&[], RetryPolicy::default());

        let err = orchestrator.invoke(&json!({"a": 1, "b": 2})).await.unwrap_err();

        assert!(matches!(err, GatewayError::NoEndpoints { .. }));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_unwrapped() {
        let (orchestrator, calls) = orchestrator(&["reject:1", "ok:1"], RetryPolicy::default());

        let err = orchestrator.invoke(&json!({"a": 1, "b": 2})).await.unwrap_err();

        assert!(matches!(err, GatewayError::Downstream { .. }));
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_is_canceled_at_deadline() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        let (orchestrator, calls) = orchestrator(&["hang:1", "ok:1"], policy);

        let started = std::time::Instant::now();
        let err = orchestrator.invoke(&json!({"a": 1, "b": 2})).await.unwrap_err();

        assert!(matches!(err, GatewayError::Canceled { attempts: 1, .. }));
        assert_eq!(calls.lock().as_slice(), ["hang:1"]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_abort_token_cancels_in_flight_attempt() {
        let (orchestrator, _calls) = orchestrator(&["hang:1"], RetryPolicy::new(1, Duration::from_secs(30)));
        let abort = CancellationToken::new();
        let ctx = CallContext::with_budget(Duration::from_secs(30)).with_cancellation(abort.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort.cancel();
        });

        let err = orchestrator.invoke_with(&json!({"a": 1, "b": 2}), ctx).await.unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, GatewayError::Canceled { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_spent_budget_cancels_before_first_attempt() {
        let (orchestrator, calls) = orchestrator(&["ok:1"], RetryPolicy::default());

        let err = orchestrator
            .invoke_with(&json!({"a": 1, "b": 2}), CallContext::with_budget(Duration::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Canceled { attempts: 0, .. }));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_on_the_deadline_is_canceled() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        let (orchestrator, calls) = orchestrator(&["late:1", "ok:1"], policy);

        let err = orchestrator.invoke(&json!({"a": 1, "b": 2})).await.unwrap_err();

        assert!(matches!(err, GatewayError::Canceled { attempts: 1, .. }), "{err}");
        assert_eq!(calls.lock().as_slice(), ["late:1"]);
    }
}
