//! Protocol routing stage.
//!
//! Walks the ordered list of transport candidates at open time and pins
//! the first one whose `open` succeeds; the pin holds for the lifetime of
//! the client unless the transport reports itself unusable, in which case
//! it is disposed and the candidate walk runs again on the next open.
//!
//! A non-transient open failure (bad credential, TLS failure, malformed
//! request, missing device) means the hub rejected the client rather than
//! the wire being flaky, so it short-circuits to the caller instead of
//! trying the next candidate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IotHubError;
use crate::message::{
    DirectMethodResponse, LockToken, ReceivedMessage, TelemetryMessage, TwinDocument,
    TwinUpdateResponse,
};
use crate::pipeline::{ClosedReason, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::RetryPolicy;
use crate::transport::{TransportFactory, TransportSettings};

#[derive(Debug)]
pub(crate) struct ProtocolRoutingHandler {
    factories: Vec<Arc<dyn TransportFactory>>,
    settings: TransportSettings,
    active: Mutex<Option<Arc<dyn PipelineHandler>>>,
}

impl ProtocolRoutingHandler {
    pub fn new(factories: Vec<Arc<dyn TransportFactory>>, settings: TransportSettings) -> Self {
        ProtocolRoutingHandler {
            factories,
            settings,
            active: Mutex::new(None),
        }
    }

    fn active_handler(&self) -> Result<Arc<dyn PipelineHandler>, PipelineError> {
        self.active
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IotHubError::not_opened().into())
    }
}

#[async_trait]
impl PipelineHandler for ProtocolRoutingHandler {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        // a previously selected transport is reused as long as it is usable
        let pinned = self.active.lock().unwrap().clone();
        if let Some(transport) = pinned {
            if transport.is_usable() {
                return transport.open(cancel).await;
            }
            debug!("pinned transport is no longer usable, disposing it");
            self.active.lock().unwrap().take();
            transport.dispose();
        }

        let mut last_error: Option<PipelineError> = None;
        for factory in &self.factories {
            if cancel.is_cancelled() {
                return Err(IotHubError::cancelled().into());
            }
            let candidate = factory.create(&self.settings);
            debug!(transport = %factory.kind(), "attempting transport candidate");
            match candidate.open(cancel.clone()).await {
                Ok(()) => {
                    info!(transport = %factory.kind(), "transport selected");
                    *self.active.lock().unwrap() = Some(candidate);
                    return Ok(());
                }
                Err(error) => {
                    candidate.dispose();
                    if !error.is_transient() {
                        // the hub rejected this client; the next protocol
                        // will not fare better
                        return Err(error);
                    }
                    warn!(
                        transport = %factory.kind(),
                        error = %error,
                        "transport candidate failed, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            IotHubError::invalid_state("no transport candidates are configured").into()
        }))
    }

    async fn close(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let transport = self.active.lock().unwrap().clone();
        match transport {
            Some(transport) => transport.close(cancel).await,
            None => Ok(()),
        }
    }

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?.send_telemetry(message, cancel).await
    }

    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .send_telemetry_batch(messages, cancel)
            .await
    }

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError> {
        self.active_handler()?.receive_message(cancel).await
    }

    async fn complete_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .complete_message(lock_token, cancel)
            .await
    }

    async fn abandon_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .abandon_message(lock_token, cancel)
            .await
    }

    async fn reject_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .reject_message(lock_token, cancel)
            .await
    }

    async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, PipelineError> {
        self.active_handler()?.get_twin(cancel).await
    }

    async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError> {
        self.active_handler()?
            .update_reported_properties(patch, cancel)
            .await
    }

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .send_method_response(response, cancel)
            .await
    }

    async fn refresh_sas_token(
        &self,
        cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError> {
        self.active_handler()?.refresh_sas_token(cancel).await
    }

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?.enable_subscription(kind, cancel).await
    }

    async fn disable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.active_handler()?
            .disable_subscription(kind, cancel)
            .await
    }

    async fn wait_for_transport_closed(&self) -> ClosedReason {
        let transport = self.active.lock().unwrap().clone();
        match transport {
            Some(transport) => transport.wait_for_transport_closed().await,
            None => {
                warn!("transport-closed awaited with no transport selected");
                ClosedReason::Graceful
            }
        }
    }

    fn set_retry_policy(&self, _policy: Arc<dyn RetryPolicy>) {
        // retries happen above this stage
    }

    fn is_usable(&self) -> bool {
        true
    }

    fn dispose(&self) {
        if let Some(transport) = self.active.lock().unwrap().take() {
            transport.dispose();
        }
    }
}
