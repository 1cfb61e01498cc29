//! Scriptable in-memory transport used by the pipeline tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::IotHubError;
use crate::message::{
    DirectMethodResponse, LockToken, ReceivedMessage, TelemetryMessage, TwinDocument,
    TwinUpdateResponse,
};
use crate::pipeline::{ClosedReason, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::RetryPolicy;
use crate::transport::{TransportError, TransportFactory, TransportKind, TransportSettings};

/// Knobs and records shared between a test and the fake transport(s) it
/// drives. Cloned into every transport a [`FakeFactory`] creates, so
/// counters accumulate across reconnects.
#[derive(Default)]
pub(crate) struct FakeScript {
    open_failures: Mutex<VecDeque<TransportError>>,
    open_calls: AtomicUsize,
    telemetry_failures: Mutex<VecDeque<TransportError>>,
    telemetry_calls: AtomicUsize,
    telemetry_blocks: AtomicBool,
    refresh_failures: Mutex<VecDeque<TransportError>>,
    refresh_calls: AtomicUsize,
    enabled: Mutex<Vec<SubscriptionKind>>,
    settlements: Mutex<Vec<(&'static str, String)>>,
    inbox: Mutex<VecDeque<ReceivedMessage>>,
    inbox_notify: Notify,
    closed_slot: Mutex<Option<ClosedReason>>,
    closed_notify: Notify,
    close_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    unusable: AtomicBool,
}

impl FakeScript {
    pub fn fail_next_open(&self, error: TransportError) {
        self.open_failures.lock().unwrap().push_back(error);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_telemetry(&self, error: TransportError) {
        self.telemetry_failures.lock().unwrap().push_back(error);
    }

    /// Makes telemetry sends park until their cancellation token fires.
    pub fn block_telemetry(&self) {
        self.telemetry_blocks.store(true, Ordering::SeqCst);
    }

    pub fn telemetry_calls(&self) -> usize {
        self.telemetry_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_refresh(&self, error: TransportError) {
        self.refresh_failures.lock().unwrap().push_back(error);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Every `enable_subscription` call observed, in order, across opens.
    pub fn enabled_subscriptions(&self) -> Vec<SubscriptionKind> {
        self.enabled.lock().unwrap().clone()
    }

    pub fn settlements(&self) -> Vec<(&'static str, String)> {
        self.settlements.lock().unwrap().clone()
    }

    pub fn push_c2d(&self, message: ReceivedMessage) {
        self.inbox.lock().unwrap().push_back(message);
        self.inbox_notify.notify_one();
    }

    /// Completes the transport-closed future with the given reason.
    pub fn trigger_closed(&self, reason: ClosedReason) {
        *self.closed_slot.lock().unwrap() = Some(reason);
        self.closed_notify.notify_one();
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    pub fn mark_unusable(&self) {
        self.unusable.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FakeTransport {
    script: Arc<FakeScript>,
}

impl FakeTransport {
    pub fn new() -> (Self, Arc<FakeScript>) {
        let script = Arc::new(FakeScript::default());
        (
            FakeTransport {
                script: Arc::clone(&script),
            },
            script,
        )
    }

    pub fn from_script(script: Arc<FakeScript>) -> Self {
        FakeTransport { script }
    }
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransport").finish()
    }
}

#[async_trait]
impl PipelineHandler for FakeTransport {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(IotHubError::cancelled().into());
        }
        self.script.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.open_failures.lock().unwrap().pop_front() {
            return Err(error.into());
        }
        // fresh connection: clear any stale closed signal
        *self.script.closed_slot.lock().unwrap() = None;
        Ok(())
    }

    async fn close(&self, _cancel: CancellationToken) -> Result<(), PipelineError> {
        self.script.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_telemetry(
        &self,
        _message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.script.telemetry_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.telemetry_blocks.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(IotHubError::cancelled().into());
        }
        if let Some(error) = self.script.telemetry_failures.lock().unwrap().pop_front() {
            return Err(error.into());
        }
        Ok(())
    }

    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        for message in messages {
            self.send_telemetry(message, cancel.clone()).await?;
        }
        Ok(())
    }

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError> {
        loop {
            if let Some(message) = self.script.inbox.lock().unwrap().pop_front() {
                return Ok(message);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(IotHubError::cancelled().into()),
                () = self.script.inbox_notify.notified() => {}
            }
        }
    }

    async fn complete_message(
        &self,
        lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.script
            .settlements
            .lock()
            .unwrap()
            .push(("complete", lock_token.as_str().to_owned()));
        Ok(())
    }

    async fn abandon_message(
        &self,
        lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.script
            .settlements
            .lock()
            .unwrap()
            .push(("abandon", lock_token.as_str().to_owned()));
        Ok(())
    }

    async fn reject_message(
        &self,
        lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.script
            .settlements
            .lock()
            .unwrap()
            .push(("reject", lock_token.as_str().to_owned()));
        Ok(())
    }

    async fn get_twin(&self, _cancel: CancellationToken) -> Result<TwinDocument, PipelineError> {
        Ok(TwinDocument {
            desired: serde_json::json!({}),
            reported: serde_json::json!({}),
        })
    }

    async fn update_reported_properties(
        &self,
        _patch: serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError> {
        Ok(TwinUpdateResponse { version: 1 })
    }

    async fn send_method_response(
        &self,
        _response: DirectMethodResponse,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn refresh_sas_token(
        &self,
        _cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError> {
        self.script.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.refresh_failures.lock().unwrap().pop_front() {
            return Err(error.into());
        }
        Ok(Utc::now() + ChronoDuration::hours(1))
    }

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.script.enabled.lock().unwrap().push(kind);
        Ok(())
    }

    async fn disable_subscription(
        &self,
        _kind: SubscriptionKind,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn wait_for_transport_closed(&self) -> ClosedReason {
        loop {
            if let Some(reason) = self.script.closed_slot.lock().unwrap().take() {
                return reason;
            }
            self.script.closed_notify.notified().await;
        }
    }

    fn set_retry_policy(&self, _policy: Arc<dyn RetryPolicy>) {}

    fn is_usable(&self) -> bool {
        !self.script.unusable.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.script.dispose_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing fake transports that all share one script.
pub(crate) struct FakeFactory {
    kind: TransportKind,
    script: Arc<FakeScript>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn new(kind: TransportKind) -> (Arc<Self>, Arc<FakeScript>) {
        let script = Arc::new(FakeScript::default());
        (
            Arc::new(FakeFactory {
                kind,
                script: Arc::clone(&script),
                created: AtomicUsize::new(0),
            }),
            script,
        )
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FakeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeFactory").field("kind", &self.kind).finish()
    }
}

impl TransportFactory for FakeFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn create(&self, _settings: &TransportSettings) -> Arc<dyn PipelineHandler> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeTransport::from_script(Arc::clone(&self.script)))
    }
}

/// A minimal settings value for tests that never reach a real wire.
pub(crate) fn test_settings() -> TransportSettings {
    use crate::auth::StaticSasToken;
    use crate::callbacks::EventDispatcher;
    use std::time::Duration;

    TransportSettings {
        hostname: "hub.example.test".to_owned(),
        port: 1883,
        device_id: "device-1".to_owned(),
        module_id: None,
        sas_provider: Arc::new(StaticSasToken::new(
            "SharedAccessSignature sr=test",
            Utc::now() + ChronoDuration::hours(1),
        )),
        keep_alive: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(120),
        dispatcher: Arc::new(EventDispatcher::default()),
    }
}
