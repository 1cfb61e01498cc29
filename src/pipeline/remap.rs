//! Error remapping stage.
//!
//! Converts every raw transport failure bubbling up from below into the
//! unified [`IotHubError`](crate::error::IotHubError) taxonomy, carrying
//! the original cause and any service tracking id along. Successful
//! results pass through untouched, as do errors that are already
//! unified.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::message::{
    DirectMethodResponse, LockToken, ReceivedMessage, TelemetryMessage, TwinDocument,
    TwinUpdateResponse,
};
use crate::pipeline::{ClosedReason, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::RetryPolicy;

#[derive(Debug)]
pub(crate) struct ErrorRemappingHandler {
    inner: Arc<dyn PipelineHandler>,
}

impl ErrorRemappingHandler {
    pub fn new(inner: Arc<dyn PipelineHandler>) -> Self {
        ErrorRemappingHandler { inner }
    }

    fn remap(error: PipelineError) -> PipelineError {
        PipelineError::Unified(error.into_unified())
    }
}

#[async_trait]
impl PipelineHandler for ErrorRemappingHandler {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        self.inner.open(cancel).await.map_err(Self::remap)
    }

    async fn close(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        self.inner.close(cancel).await.map_err(Self::remap)
    }

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .send_telemetry(message, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .send_telemetry_batch(messages, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError> {
        self.inner.receive_message(cancel).await.map_err(Self::remap)
    }

    async fn complete_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .complete_message(lock_token, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn abandon_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .abandon_message(lock_token, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn reject_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .reject_message(lock_token, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, PipelineError> {
        self.inner.get_twin(cancel).await.map_err(Self::remap)
    }

    async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError> {
        self.inner
            .update_reported_properties(patch, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .send_method_response(response, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn refresh_sas_token(
        &self,
        cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError> {
        self.inner
            .refresh_sas_token(cancel)
            .await
            .map_err(Self::remap)
    }

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .enable_subscription(kind, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn disable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        self.inner
            .disable_subscription(kind, cancel)
            .await
            .map_err(Self::remap)
    }

    async fn wait_for_transport_closed(&self) -> ClosedReason {
        self.inner.wait_for_transport_closed().await
    }

    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        self.inner.set_retry_policy(policy);
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}
