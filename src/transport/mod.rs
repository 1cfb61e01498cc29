//! The seam between the pipeline and concrete wire protocols.
//!
//! A transport adapter is the leaf of the handler pipeline: it implements
//! [`PipelineHandler`](crate::pipeline::PipelineHandler) against a real
//! protocol library and reports failures as [`TransportError`] values,
//! which the error remapping stage classifies into the unified taxonomy.
//! Adapters are constructed through a [`TransportFactory`] so the protocol
//! routing stage can build a fresh instance per connection attempt.

#[cfg(feature = "transport-mqtt")]
pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::auth::SasTokenProvider;
use crate::callbacks::EventDispatcher;
use crate::pipeline::PipelineHandler;

/// Raw errors produced by transport adapters.
///
/// These never reach the application; the pipeline remaps them into
/// [`IotHubError`](crate::error::IotHubError) values.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("network failure: {0}")]
    Network(String),
    #[error("the connection attempt timed out")]
    Timeout,
    #[error("the service throttled the request")]
    Throttled { tracking_id: Option<String> },
    #[error("the service is temporarily unavailable")]
    ServerBusy { tracking_id: Option<String> },
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    #[error("not authorized: {message}")]
    Unauthorized {
        message: String,
        tracking_id: Option<String>,
    },
    #[error("the device or module identity was not found")]
    DeviceNotFound { tracking_id: Option<String> },
    #[error("the device identity is disabled")]
    DeviceDisabled { tracking_id: Option<String> },
    #[error("the message exceeds the maximum size accepted by the service")]
    MessageTooLarge { limit: Option<usize> },
    #[error("the lock token `{0}` is no longer valid")]
    LockLost(String),
    #[error("TLS authentication failed: {0}")]
    Tls(String),
    #[error("the hub quota has been exceeded")]
    QuotaExceeded { tracking_id: Option<String> },
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// The service-side correlator, when the service supplied one.
    pub fn tracking_id(&self) -> Option<&str> {
        match self {
            TransportError::Throttled { tracking_id }
            | TransportError::ServerBusy { tracking_id }
            | TransportError::Unauthorized { tracking_id, .. }
            | TransportError::DeviceNotFound { tracking_id }
            | TransportError::DeviceDisabled { tracking_id }
            | TransportError::QuotaExceeded { tracking_id } => tracking_id.as_deref(),
            _ => None,
        }
    }
}

/// The protocols a client can be configured to try, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    MqttTcp,
    MqttWebSocket,
    AmqpTcp,
    AmqpWebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::MqttTcp => "MQTT over TCP",
            TransportKind::MqttWebSocket => "MQTT over WebSocket",
            TransportKind::AmqpTcp => "AMQP over TCP",
            TransportKind::AmqpWebSocket => "AMQP over WebSocket",
        };
        f.write_str(name)
    }
}

/// Everything a transport adapter needs to reach the hub.
#[derive(Clone)]
pub struct TransportSettings {
    pub hostname: String,
    pub port: u16,
    pub device_id: String,
    pub module_id: Option<String>,
    pub sas_provider: Arc<dyn SasTokenProvider>,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    /// Where server-initiated events (C2D messages, method invocations,
    /// desired-property updates) are delivered.
    pub dispatcher: Arc<EventDispatcher>,
}

impl fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSettings")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("keep_alive", &self.keep_alive)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Builds fresh transport handlers for the protocol routing stage.
///
/// One factory per candidate protocol; the routing stage walks its
/// configured factories in order and pins the first whose `open`
/// succeeds.
pub trait TransportFactory: fmt::Debug + Send + Sync {
    fn kind(&self) -> TransportKind;
    fn create(&self, settings: &TransportSettings) -> Arc<dyn PipelineHandler>;
}
