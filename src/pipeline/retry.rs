//! Retry stage.
//!
//! Wraps every operation in the configured [`RetryPolicy`]: transient
//! failures are retried after the policy-chosen delay (floored at one
//! second so a zero-delay policy cannot spin), fatal classes surface
//! immediately, and the whole loop is bounded by the configured
//! operation timeout and the caller's cancellation token.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorCode, IotHubError};
use crate::message::{
    DirectMethodResponse, LockToken, ReceivedMessage, TelemetryMessage, TwinDocument,
    TwinUpdateResponse,
};
use crate::pipeline::{ClosedReason, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::{ConnectionStatus, ConnectionStatusChangeReason, ConnectionStatusNotifier};

/// Minimum spacing between attempts, enforced here rather than in the
/// policies so a user-supplied policy cannot cause a tight loop.
const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How the retry loop treats a particular operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryScope {
    /// Lifecycle open: policy exhaustion additionally reports
    /// `(Disconnected, RetryExpired)`.
    Open,
    /// Ordinary operation.
    Operation,
    /// Token refresh: only network-class failures are retried.
    TokenRefresh,
}

type Attempt<'a, T> = Pin<Box<dyn Future<Output = Result<T, PipelineError>> + Send + 'a>>;

#[derive(Debug)]
pub(crate) struct RetryHandler {
    inner: Arc<dyn PipelineHandler>,
    policy: Mutex<Arc<dyn RetryPolicy>>,
    operation_timeout: Duration,
    notifier: ConnectionStatusNotifier,
}

impl RetryHandler {
    pub fn new(
        inner: Arc<dyn PipelineHandler>,
        policy: Arc<dyn RetryPolicy>,
        operation_timeout: Duration,
        notifier: ConnectionStatusNotifier,
    ) -> Self {
        RetryHandler {
            inner,
            policy: Mutex::new(policy),
            operation_timeout,
            notifier,
        }
    }

    fn current_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::clone(&self.policy.lock().unwrap())
    }

    /// Runs `attempt` until it succeeds, the policy stops, a fatal error
    /// surfaces, the caller cancels, or the operation timeout elapses.
    async fn execute<'a, T, F>(
        &'a self,
        operation: &'static str,
        scope: RetryScope,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(CancellationToken) -> Attempt<'a, T> + Send,
        T: Send,
    {
        let deadline = tokio::time::Instant::now() + self.operation_timeout;
        let timed = tokio::time::timeout_at(deadline, async {
            let mut attempt_count: u32 = 0;
            loop {
                attempt_count += 1;
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Err(PipelineError::Unified(IotHubError::cancelled()));
                    }
                    result = attempt(cancel.clone()) => result,
                };
                let error = match result {
                    Ok(value) => return Ok(value),
                    Err(error) => error.into_unified(),
                };

                match error.code() {
                    // cancellation, timeout and disposal are surfaced
                    // as-is, never retried
                    ErrorCode::OperationCancelled
                    | ErrorCode::OperationTimedOut
                    | ErrorCode::ClientDisposed => return Err(error.into()),
                    ErrorCode::Unauthorized => {
                        self.notifier.emit(
                            ConnectionStatus::Disconnected,
                            ConnectionStatusChangeReason::BadCredential,
                        );
                        return Err(error.into());
                    }
                    ErrorCode::DeviceDisabled => {
                        self.notifier.emit(
                            ConnectionStatus::Disconnected,
                            ConnectionStatusChangeReason::DeviceDisabled,
                        );
                        return Err(error.into());
                    }
                    _ => {}
                }
                if !error.is_transient() {
                    return Err(error.into());
                }
                if scope == RetryScope::TokenRefresh && error.code() != ErrorCode::NetworkErrors {
                    return Err(error.into());
                }

                match self.current_policy().should_retry(attempt_count, &error) {
                    RetryDecision::Stop => {
                        warn!(
                            operation,
                            attempt = attempt_count,
                            error = %error,
                            "retry policy exhausted"
                        );
                        if scope == RetryScope::Open {
                            self.notifier.emit(
                                ConnectionStatus::Disconnected,
                                ConnectionStatusChangeReason::RetryExpired,
                            );
                        }
                        return Err(error.into());
                    }
                    RetryDecision::RetryAfter(delay) => {
                        let delay = delay.max(MIN_RETRY_DELAY);
                        debug!(
                            operation,
                            attempt = attempt_count,
                            ?delay,
                            error = %error,
                            "transient failure, retrying"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                return Err(PipelineError::Unified(IotHubError::cancelled()));
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
        match timed.await {
            Ok(result) => result,
            Err(_) => Err(IotHubError::timed_out(self.operation_timeout).into()),
        }
    }
}

#[async_trait]
impl PipelineHandler for RetryHandler {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("open", RetryScope::Open, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.open(token).await })
        })
        .await
    }

    async fn close(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        // close is not retried; a failed close surfaces directly
        self.inner.close(cancel).await
    }

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("send_telemetry", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            let message = message.clone();
            Box::pin(async move { inner.send_telemetry(message, token).await })
        })
        .await
    }

    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "send_telemetry_batch",
            RetryScope::Operation,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                let messages = messages.clone();
                Box::pin(async move { inner.send_telemetry_batch(messages, token).await })
            },
        )
        .await
    }

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("receive_message", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.receive_message(token).await })
        })
        .await
    }

    async fn complete_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("complete_message", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            let lock_token = lock_token.clone();
            Box::pin(async move { inner.complete_message(lock_token, token).await })
        })
        .await
    }

    async fn abandon_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("abandon_message", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            let lock_token = lock_token.clone();
            Box::pin(async move { inner.abandon_message(lock_token, token).await })
        })
        .await
    }

    async fn reject_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("reject_message", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            let lock_token = lock_token.clone();
            Box::pin(async move { inner.reject_message(lock_token, token).await })
        })
        .await
    }

    async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute("get_twin", RetryScope::Operation, &cancel, move |token| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.get_twin(token).await })
        })
        .await
    }

    async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "update_reported_properties",
            RetryScope::Operation,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                let patch = patch.clone();
                Box::pin(async move { inner.update_reported_properties(patch, token).await })
            },
        )
        .await
    }

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "send_method_response",
            RetryScope::Operation,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                let response = response.clone();
                Box::pin(async move { inner.send_method_response(response, token).await })
            },
        )
        .await
    }

    async fn refresh_sas_token(
        &self,
        cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "refresh_sas_token",
            RetryScope::TokenRefresh,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.refresh_sas_token(token).await })
            },
        )
        .await
    }

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "enable_subscription",
            RetryScope::Operation,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.enable_subscription(kind, token).await })
            },
        )
        .await
    }

    async fn disable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        self.execute(
            "disable_subscription",
            RetryScope::Operation,
            &cancel,
            move |token| {
                let inner = Arc::clone(&inner);
                Box::pin(async move { inner.disable_subscription(kind, token).await })
            },
        )
        .await
    }

    async fn wait_for_transport_closed(&self) -> ClosedReason {
        self.inner.wait_for_transport_closed().await
    }

    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        *self.policy.lock().unwrap() = policy;
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::remap::ErrorRemappingHandler;
    use crate::pipeline::testing::{FakeScript, FakeTransport};
    use crate::retry::NoRetry;
    use crate::transport::TransportError;
    use std::fmt;

    fn network_error() -> TransportError {
        TransportError::Network("connection reset".to_owned())
    }

    /// Fixed-delay policy that records every consultation.
    struct RecordingPolicy {
        delay: Duration,
        max_attempts: u32,
        consultations: Mutex<Vec<u32>>,
    }

    impl RecordingPolicy {
        fn new(delay: Duration, max_attempts: u32) -> Arc<Self> {
            Arc::new(RecordingPolicy {
                delay,
                max_attempts,
                consultations: Mutex::new(Vec::new()),
            })
        }
    }

    impl fmt::Debug for RecordingPolicy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingPolicy").finish()
        }
    }

    impl RetryPolicy for RecordingPolicy {
        fn should_retry(&self, attempt: u32, _last_error: &IotHubError) -> RetryDecision {
            self.consultations.lock().unwrap().push(attempt);
            if attempt >= self.max_attempts {
                RetryDecision::Stop
            } else {
                RetryDecision::RetryAfter(self.delay)
            }
        }
    }

    fn handler_with(
        policy: Arc<dyn RetryPolicy>,
        operation_timeout: Duration,
    ) -> (RetryHandler, Arc<FakeScript>, ConnectionStatusNotifier) {
        let (fake, script) = FakeTransport::new();
        let remap = Arc::new(ErrorRemappingHandler::new(Arc::new(fake)));
        let notifier = ConnectionStatusNotifier::default();
        let handler = RetryHandler::new(remap, policy, operation_timeout, notifier.clone());
        (handler, script, notifier)
    }

    fn status_recorder(
        notifier: &ConnectionStatusNotifier,
    ) -> Arc<Mutex<Vec<(ConnectionStatus, ConnectionStatusChangeReason)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        notifier.set_callback(Arc::new(move |status, reason| {
            sink.lock().unwrap().push((status, reason));
        }));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn policy_consulted_once_per_failure_and_delay_honored() {
        let policy = RecordingPolicy::new(Duration::from_secs(5), 10);
        let (handler, script, _notifier) =
            handler_with(policy.clone(), Duration::from_secs(600));
        script.fail_next_open(network_error());
        script.fail_next_open(network_error());

        let started = tokio::time::Instant::now();
        handler.open(CancellationToken::new()).await.unwrap();

        assert_eq!(script.open_calls(), 3);
        assert_eq!(*policy.consultations.lock().unwrap(), vec![1, 2]);
        // two sleeps of exactly the policy delay (above the 1 s floor)
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_policy_delays_are_floored() {
        let policy = RecordingPolicy::new(Duration::ZERO, 10);
        let (handler, script, _notifier) = handler_with(policy, Duration::from_secs(600));
        script.fail_next_open(network_error());

        let started = tokio::time::Instant::now();
        handler.open(CancellationToken::new()).await.unwrap();
        assert_eq!(started.elapsed(), MIN_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error_and_reports_retry_expired_for_open() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 2);
        let (handler, script, notifier) = handler_with(policy, Duration::from_secs(600));
        let seen = status_recorder(&notifier);
        for _ in 0..3 {
            script.fail_next_open(network_error());
        }

        let err = handler.open(CancellationToken::new()).await.unwrap_err();
        let unified = err.into_unified();
        assert_eq!(unified.code(), ErrorCode::NetworkErrors);
        assert!(unified.is_transient());
        assert_eq!(script.open_calls(), 2, "policy allowed exactly two attempts");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                ConnectionStatus::Disconnected,
                ConnectionStatusChangeReason::RetryExpired
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn operation_exhaustion_does_not_touch_status() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 2);
        let (handler, script, notifier) = handler_with(policy, Duration::from_secs(600));
        let seen = status_recorder(&notifier);
        for _ in 0..3 {
            script.fail_next_telemetry(network_error());
        }

        let err = handler
            .send_telemetry(TelemetryMessage::new("x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::NetworkErrors);
        assert_eq!(script.telemetry_calls(), 2);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_and_reports_bad_credential() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 10);
        let (handler, script, notifier) = handler_with(policy.clone(), Duration::from_secs(600));
        let seen = status_recorder(&notifier);
        script.fail_next_open(TransportError::Unauthorized {
            message: "expired signature".to_owned(),
            tracking_id: None,
        });

        let err = handler.open(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::Unauthorized);
        assert_eq!(script.open_calls(), 1, "auth failures must not be retried");
        assert!(policy.consultations.lock().unwrap().is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                ConnectionStatus::Disconnected,
                ConnectionStatusChangeReason::BadCredential
            )]
        );
    }

    #[tokio::test]
    async fn device_disabled_is_fatal_and_reported() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 10);
        let (handler, script, notifier) = handler_with(policy, Duration::from_secs(600));
        let seen = status_recorder(&notifier);
        script.fail_next_open(TransportError::DeviceDisabled { tracking_id: None });

        let err = handler.open(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::DeviceDisabled);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                ConnectionStatus::Disconnected,
                ConnectionStatusChangeReason::DeviceDisabled
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_sleep_surfaces_promptly() {
        let policy = RecordingPolicy::new(Duration::from_secs(60), 10);
        let (handler, script, _notifier) = handler_with(policy, Duration::from_secs(600));
        script.fail_next_telemetry(network_error());

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let err = handler
            .send_telemetry(TelemetryMessage::new("x"), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::OperationCancelled);
        assert_eq!(script.telemetry_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_bounds_the_whole_loop() {
        let policy = RecordingPolicy::new(Duration::from_secs(10), u32::MAX);
        let (handler, script, _notifier) = handler_with(policy, Duration::from_secs(25));
        for _ in 0..10 {
            script.fail_next_telemetry(network_error());
        }

        let err = handler
            .send_telemetry(TelemetryMessage::new("x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::OperationTimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn token_refresh_retries_only_network_failures() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 10);
        let (handler, script, _notifier) = handler_with(policy, Duration::from_secs(600));

        script.fail_next_refresh(network_error());
        handler
            .refresh_sas_token(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(script.refresh_calls(), 2);

        // a throttle is transient, but refresh only retries the network class
        script.fail_next_refresh(TransportError::Throttled { tracking_id: None });
        let err = handler
            .refresh_sas_token(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::Throttled);
        assert_eq!(script.refresh_calls(), 3);
    }

    #[tokio::test]
    async fn policy_swap_applies_to_subsequent_operations() {
        let policy = RecordingPolicy::new(Duration::from_secs(1), 10);
        let (handler, script, _notifier) = handler_with(policy, Duration::from_secs(600));
        handler.set_retry_policy(Arc::new(NoRetry));
        script.fail_next_telemetry(network_error());

        let err = handler
            .send_telemetry(TelemetryMessage::new("x"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.into_unified().code(), ErrorCode::NetworkErrors);
        assert_eq!(script.telemetry_calls(), 1);
    }
}
