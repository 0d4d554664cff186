use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use courier_common::message::NotificationRequest;
use courier_common::retry::RetryPolicy;

use crate::backend::{DeliveryId, MailBackend, OutboundEmail};
use crate::error::DeliveryError;

/// The result of dispatching one `NotificationRequest`: produced exactly
/// once, consumed by logging/metrics, never persisted.
#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered {
        delivery_id: DeliveryId,
        attempts: u32,
    },
    Failed {
        error: DeliveryError,
        attempts: u32,
    },
}

/// Wraps one delivery attempt in a timeout and a bounded-retry loop.
///
/// Retries apply uniformly to every backend error: the policy does not
/// distinguish transient failures from permanent rejections, so a
/// permanently-invalid recipient still burns the full attempt budget.
/// Tightening this would change observable attempt counts and timing, so
/// the coarse policy is kept on purpose.
pub struct Dispatcher {
    backend: Arc<dyn MailBackend>,
    from_address: String,
    max_attempts: u32,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn MailBackend>,
        from_address: String,
        max_attempts: u32,
        attempt_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            from_address,
            max_attempts,
            attempt_timeout,
            retry_policy,
        }
    }

    /// Probe the backend once; used by the pipeline at start.
    pub async fn verify_backend(&self) -> Result<(), DeliveryError> {
        self.backend.verify().await
    }

    /// Attempt delivery of a validated request, retrying failed attempts up
    /// to the configured budget with linearly growing waits in between.
    pub async fn dispatch(&self, request: &NotificationRequest) -> DispatchOutcome {
        let email = OutboundEmail::new(&self.from_address, request);
        let mut last_error: Option<DeliveryError> = None;

        for attempt in 1..=self.max_attempts {
            let started = tokio::time::Instant::now();

            // The timeout is a hard wait ceiling per attempt. Dropping the
            // send future on expiry stops waiting and discards any late
            // result; whether the underlying wire call is aborted is the
            // backend's concern, so a late success can mean a duplicate
            // send. That is accepted at-least-once behavior.
            let result =
                tokio::time::timeout(self.attempt_timeout, self.backend.send(&email)).await;

            let elapsed = started.elapsed().as_secs_f64();
            metrics::histogram!("courier_dispatch_attempt_duration_seconds").record(elapsed);

            let error = match result {
                Ok(Ok(delivery_id)) => {
                    metrics::counter!("courier_deliveries_succeeded_total").increment(1);
                    return DispatchOutcome::Delivered {
                        delivery_id,
                        attempts: attempt,
                    };
                }
                Ok(Err(error)) => error,
                Err(_) => DeliveryError::Timeout(self.attempt_timeout),
            };

            warn!(
                to = request.recipient(),
                attempt,
                max_attempts = self.max_attempts,
                error = %error,
                "delivery attempt failed"
            );
            metrics::counter!("courier_delivery_attempts_failed_total").increment(1);
            last_error = Some(error);

            if attempt < self.max_attempts {
                metrics::counter!("courier_deliveries_retried_total").increment(1);
                tokio::time::sleep(self.retry_policy.time_until_next_attempt(attempt)).await;
            }
        }

        metrics::counter!("courier_deliveries_failed_total").increment(1);
        DispatchOutcome::Failed {
            error: last_error
                .unwrap_or_else(|| DeliveryError::Backend("no delivery attempt was made".to_owned())),
            attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use serde_json::json;

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyBackend {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailBackend for FlakyBackend {
        async fn send(&self, _email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(DeliveryError::Backend(format!("boom on call {}", call)))
            } else {
                Ok(format!("delivery-{}", call))
            }
        }
    }

    /// Sleeps longer than any test timeout on the first `slow_calls` sends.
    struct SlowBackend {
        slow_calls: u32,
        calls: AtomicU32,
    }

    impl SlowBackend {
        fn slow_for(slow_calls: u32) -> Self {
            Self {
                slow_calls,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MailBackend for SlowBackend {
        async fn send(&self, _email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.slow_calls {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(format!("late-delivery-{}", call))
        }
    }

    fn request() -> NotificationRequest {
        NotificationRequest::from_value(&json!({
            "to": "a@b.com",
            "subject": "Hi",
            "message": "hello"
        }))
        .unwrap()
    }

    fn dispatcher(backend: Arc<dyn MailBackend>, base_delay_ms: u64) -> Dispatcher {
        Dispatcher::new(
            backend,
            "no-reply@example.com".to_owned(),
            3,
            Duration::from_millis(50),
            RetryPolicy::new(Duration::from_millis(base_delay_ms), None),
        )
    }

    #[tokio::test]
    async fn delivers_on_the_first_attempt() {
        let backend = Arc::new(FlakyBackend::failing(0));
        let dispatcher = dispatcher(backend.clone(), 1);

        match dispatcher.dispatch(&request()).await {
            DispatchOutcome::Delivered {
                delivery_id,
                attempts,
            } => {
                assert_eq!(delivery_id, "delivery-1");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected Delivered, got {:?}", other),
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn retries_then_delivers_without_a_third_attempt() {
        let backend = Arc::new(FlakyBackend::failing(1));
        let dispatcher = dispatcher(backend.clone(), 1);

        match dispatcher.dispatch(&request()).await {
            DispatchOutcome::Delivered { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Delivered, got {:?}", other),
        }
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let backend = Arc::new(FlakyBackend::failing(u32::MAX));
        let dispatcher = dispatcher(backend.clone(), 1);

        match dispatcher.dispatch(&request()).await {
            DispatchOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, DeliveryError::Backend(_)));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn waits_grow_linearly_between_attempts() {
        let backend = Arc::new(FlakyBackend::failing(u32::MAX));
        // base 20ms: the two inter-attempt waits should sum to ~60ms (1x + 2x)
        let dispatcher = dispatcher(backend, 20);

        let started = Instant::now();
        let outcome = dispatcher.dispatch(&request()).await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert!(
            elapsed >= Duration::from_millis(60),
            "expected at least 60ms of inter-attempt waits, got {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn a_timed_out_attempt_counts_as_failed_and_the_next_proceeds() {
        let backend = Arc::new(SlowBackend::slow_for(1));
        let dispatcher = dispatcher(backend, 1);

        match dispatcher.dispatch(&request()).await {
            DispatchOutcome::Delivered { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Delivered on the second attempt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exhausting_the_budget_on_timeouts_reports_a_timeout() {
        let backend = Arc::new(SlowBackend::slow_for(u32::MAX));
        let dispatcher = dispatcher(backend, 1);

        match dispatcher.dispatch(&request()).await {
            DispatchOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, DeliveryError::Timeout(_)));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
