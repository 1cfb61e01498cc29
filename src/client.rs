use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::callbacks::EventDispatcher;
use crate::config::{ClientConfig, PayloadConvention};
use crate::error::IotHubError;
use crate::message::{
    DesiredPropertyUpdate, DirectMethodRequest, DirectMethodResponse, LockToken, ReceivedMessage,
    TelemetryMessage, TwinDocument, TwinUpdateResponse,
};
use crate::pipeline::{self, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::RetryPolicy;
use crate::status::{ConnectionStatus, ConnectionStatusChangeReason, ConnectionStatusNotifier};

/// A client connecting one device (or module) to an IoT hub.
///
/// Internally this is a pipeline of handlers: lifecycle state and
/// reconnection, retry, error unification, and protocol fallback across
/// the configured transport candidates. All operations are asynchronous,
/// safe to invoke concurrently, and accept a [`CancellationToken`]
/// (pass `CancellationToken::new()` when cancellation is not needed).
///
/// Every failure surfaces as an [`IotHubError`] carrying a classified
/// code and a transient flag; raw transport errors never escape.
#[derive(Debug)]
pub struct DeviceClient {
    pipeline: Arc<dyn PipelineHandler>,
    dispatcher: Arc<EventDispatcher>,
    notifier: ConnectionStatusNotifier,
    payload_convention: PayloadConvention,
}

impl DeviceClient {
    /// Builds a client from its configuration. No I/O happens until
    /// [`open`](Self::open) (or the first operation after it).
    pub fn new(config: ClientConfig) -> Result<DeviceClient, IotHubError> {
        if config.transports.is_empty() {
            return Err(IotHubError::invalid_state(
                "at least one transport candidate is required",
            ));
        }
        let dispatcher = Arc::new(EventDispatcher::default());
        let notifier = ConnectionStatusNotifier::default();
        let pipeline = pipeline::assemble(&config, Arc::clone(&dispatcher), notifier.clone());
        Ok(DeviceClient {
            pipeline,
            dispatcher,
            notifier,
            payload_convention: config.payload_convention,
        })
    }

    /// Opens the connection: walks the transport candidates, installs any
    /// registered subscriptions, and starts watching for disconnects.
    /// Concurrent calls collapse onto a single inner open.
    pub async fn open(&self, cancel: CancellationToken) -> Result<(), IotHubError> {
        self.pipeline
            .open(cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Closes the connection and cancels every pending operation. The
    /// client can be opened again afterwards.
    pub async fn close(&self, cancel: CancellationToken) -> Result<(), IotHubError> {
        self.pipeline
            .close(cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        let message = self.stamp(message);
        self.pipeline
            .send_telemetry(message, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        let messages = messages.into_iter().map(|m| self.stamp(m)).collect();
        self.pipeline
            .send_telemetry_batch(messages, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Receives the next cloud-to-device message. Only messages for which
    /// no callback is registered are delivered here.
    pub async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, IotHubError> {
        self.pipeline
            .receive_message(cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn complete_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.pipeline
            .complete_message(lock_token, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn abandon_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.pipeline
            .abandon_message(lock_token, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn reject_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.pipeline
            .reject_message(lock_token, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, IotHubError> {
        self.pipeline
            .get_twin(cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, IotHubError> {
        self.pipeline
            .update_reported_properties(patch, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.pipeline
            .send_method_response(response, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Asks the credential provider for a fresh SAS token and returns its
    /// expiry. The new token is used on the next (re)connection.
    pub async fn refresh_sas_token(
        &self,
        cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, IotHubError> {
        self.pipeline
            .refresh_sas_token(cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Replaces the retry policy. Affects subsequent operations only.
    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        self.pipeline.set_retry_policy(policy);
    }

    /// Registers the connection status callback. The callback must not
    /// block; it is invoked inline on every status transition.
    pub fn set_connection_status_callback(
        &self,
        callback: impl Fn(ConnectionStatus, ConnectionStatusChangeReason) + Send + Sync + 'static,
    ) {
        self.notifier.set_callback(Arc::new(callback));
    }

    /// Registers a callback for cloud-to-device messages and enables the
    /// corresponding subscription (kept enabled across reconnects).
    pub async fn set_incoming_message_callback(
        &self,
        callback: impl Fn(ReceivedMessage) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.dispatcher.set_message_callback(Arc::new(callback));
        self.pipeline
            .enable_subscription(SubscriptionKind::CloudToDeviceMessages, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Registers a callback for direct method invocations; the
    /// application answers via [`send_method_response`](Self::send_method_response).
    pub async fn set_direct_method_callback(
        &self,
        callback: impl Fn(DirectMethodRequest) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.dispatcher.set_method_callback(Arc::new(callback));
        self.pipeline
            .enable_subscription(SubscriptionKind::DirectMethods, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    pub async fn set_desired_property_update_callback(
        &self,
        callback: impl Fn(DesiredPropertyUpdate) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.dispatcher
            .set_desired_property_callback(Arc::new(callback));
        self.pipeline
            .enable_subscription(SubscriptionKind::DesiredPropertyUpdates, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Registers a callback for messages arriving on a module input.
    pub async fn set_input_message_callback(
        &self,
        input_name: impl Into<String>,
        callback: impl Fn(ReceivedMessage) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> Result<(), IotHubError> {
        self.dispatcher
            .set_input_callback(input_name, Arc::new(callback));
        self.pipeline
            .enable_subscription(SubscriptionKind::InputEvents, cancel)
            .await
            .map_err(PipelineError::into_unified)
    }

    /// Releases all resources; pending operations fail with a disposed
    /// error and further operations are rejected. Idempotent.
    pub fn dispose(&self) {
        self.pipeline.dispose();
    }

    fn stamp(&self, mut message: TelemetryMessage) -> TelemetryMessage {
        if message.content_type.is_none() {
            message.content_type = Some(self.payload_convention.content_type.clone());
        }
        if message.content_encoding.is_none() {
            message.content_encoding = Some(self.payload_convention.content_encoding.clone());
        }
        message
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        self.pipeline.dispose();
    }
}
