//! The chain-of-responsibility pipeline at the heart of the client.
//!
//! Every stage implements [`PipelineHandler`] and owns the next stage
//! down; the chain is assembled top-down at client construction:
//!
//! ```text
//! application → state → retry → remap → routing → transport → network
//! ```
//!
//! Stages below the error remapping stage report failures as raw
//! [`TransportError`](crate::transport::TransportError) values inside
//! [`PipelineError::Raw`]; the remapping stage converts them, so that
//! above it only unified [`IotHubError`] values exist.

pub(crate) mod remap;
pub(crate) mod retry;
pub(crate) mod routing;
pub(crate) mod state;
pub(crate) mod state_machine;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::callbacks::EventDispatcher;
use crate::config::ClientConfig;
use crate::error::IotHubError;
use crate::message::{
    DirectMethodResponse, LockToken, ReceivedMessage, TelemetryMessage, TwinDocument,
    TwinUpdateResponse,
};
use crate::retry::RetryPolicy;
use crate::status::ConnectionStatusNotifier;
use crate::transport::{TransportError, TransportSettings};

/// Categories of server-initiated events a client can subscribe to.
///
/// Subscriptions are monotonic within a client's lifetime: once enabled
/// they stay enabled, and after every successful open or reconnect they
/// are re-installed on the transport (in declaration order) before the
/// open completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    CloudToDeviceMessages,
    DirectMethods,
    DesiredPropertyUpdates,
    InputEvents,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 4] = [
        SubscriptionKind::CloudToDeviceMessages,
        SubscriptionKind::DirectMethods,
        SubscriptionKind::DesiredPropertyUpdates,
        SubscriptionKind::InputEvents,
    ];

    fn bit(self) -> u8 {
        match self {
            SubscriptionKind::CloudToDeviceMessages => 1 << 0,
            SubscriptionKind::DirectMethods => 1 << 1,
            SubscriptionKind::DesiredPropertyUpdates => 1 << 2,
            SubscriptionKind::InputEvents => 1 << 3,
        }
    }
}

/// Set of enabled subscription categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    bits: u8,
}

impl SubscriptionSet {
    pub fn insert(&mut self, kind: SubscriptionKind) {
        self.bits |= kind.bit();
    }

    pub fn remove(&mut self, kind: SubscriptionKind) {
        self.bits &= !kind.bit();
    }

    pub fn contains(&self, kind: SubscriptionKind) -> bool {
        self.bits & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Iterates the enabled kinds in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = SubscriptionKind> + '_ {
        SubscriptionKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

/// Why a transport's connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// The close was requested locally (or negotiated with the peer).
    Graceful,
    /// The connection dropped without a local close.
    Unexpected,
}

/// Error type flowing through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A raw transport failure; only exists below the remapping stage.
    #[error(transparent)]
    Raw(#[from] TransportError),
    /// A classified error; the only variant above the remapping stage.
    #[error(transparent)]
    Unified(#[from] IotHubError),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Raw(raw) => crate::error::classify(raw).is_transient(),
            PipelineError::Unified(unified) => unified.is_transient(),
        }
    }

    /// Converts into the unified taxonomy (classifying raw errors).
    pub fn into_unified(self) -> IotHubError {
        match self {
            PipelineError::Raw(raw) => IotHubError::from(raw),
            PipelineError::Unified(unified) => unified,
        }
    }
}

/// The uniform interface every pipeline stage exposes.
///
/// Each stage performs its own concern and forwards to the stage it
/// owns. Transport adapters implement this trait as the leaf; for them
/// `wait_for_transport_closed` resolves when the underlying connection
/// ends and `is_usable` reports whether the instance can still serve
/// operations.
#[async_trait]
pub trait PipelineHandler: Send + Sync + fmt::Debug {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError>;
    async fn close(&self, cancel: CancellationToken) -> Result<(), PipelineError>;

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;
    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError>;
    async fn complete_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;
    async fn abandon_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;
    async fn reject_message(
        &self,
        lock_token: LockToken,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, PipelineError>;
    async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError>;
    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn refresh_sas_token(
        &self,
        cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError>;

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;
    async fn disable_subscription(
        &self,
        kind: SubscriptionKind,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>;

    /// One-shot per connection: resolves when the transport's connection
    /// has ended, tagged with why.
    async fn wait_for_transport_closed(&self) -> ClosedReason;

    /// Replaces the retry policy for subsequent operations. Stages that
    /// do not retry forward or ignore this.
    fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>);

    fn is_usable(&self) -> bool;

    /// Releases resources. Idempotent; further operations fail.
    fn dispose(&self);
}

/// A token that fires when either parent fires.
///
/// `close` cancels a per-lifecycle token that must compose with each
/// caller's own token; the linking task lives until the returned guard is
/// dropped (operation completed) or either parent fires.
pub(crate) fn linked_token(
    first: &CancellationToken,
    second: &CancellationToken,
) -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    let linked = token.clone();
    let first = first.clone();
    let second = second.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = linked.cancelled() => {}
            () = first.cancelled() => linked.cancel(),
            () = second.cancelled() => linked.cancel(),
        }
    });
    (token, guard)
}

/// Assembles the full pipeline for a client.
pub(crate) fn assemble(
    config: &ClientConfig,
    dispatcher: Arc<EventDispatcher>,
    notifier: ConnectionStatusNotifier,
) -> Arc<state::StateHandler> {
    let settings = TransportSettings {
        hostname: config.hostname.clone(),
        port: config.port,
        device_id: config.device_id.clone(),
        module_id: config.module_id.clone(),
        sas_provider: Arc::clone(&config.sas_provider),
        keep_alive: config.keep_alive,
        idle_timeout: config.idle_timeout,
        dispatcher,
    };
    let routing = Arc::new(routing::ProtocolRoutingHandler::new(
        config.transports.clone(),
        settings,
    ));
    let remap = Arc::new(remap::ErrorRemappingHandler::new(routing));
    let retry = Arc::new(retry::RetryHandler::new(
        remap,
        Arc::clone(&config.retry_policy),
        config.operation_timeout,
        notifier.clone(),
    ));
    Arc::new(state::StateHandler::new(retry, notifier))
}
