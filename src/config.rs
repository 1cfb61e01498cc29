use std::sync::Arc;
use std::time::Duration;

use crate::auth::SasTokenProvider;
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::transport::TransportFactory;

/// Content metadata stamped on outgoing telemetry and property messages.
///
/// Opaque to the pipeline; transports forward it as message annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadConvention {
    pub content_type: String,
    pub content_encoding: String,
}

impl Default for PayloadConvention {
    fn default() -> Self {
        PayloadConvention {
            content_type: "application/json".to_owned(),
            content_encoding: "utf-8".to_owned(),
        }
    }
}

/// Configures a [`DeviceClient`](crate::DeviceClient).
#[derive(Debug)]
pub struct ClientConfig {
    /// Hostname of the hub this device belongs to.
    pub hostname: String,

    /// Port the transport connects to. TLS termination and proxying are
    /// the transport adapter's concern.
    pub port: u16,

    /// Identity of this device at the hub.
    pub device_id: String,

    /// Set when this client represents a module of the device; enables
    /// input-event routing.
    pub module_id: Option<String>,

    /// Issues a credential for every connection attempt and for
    /// `refresh_sas_token`.
    pub sas_provider: Arc<dyn SasTokenProvider>,

    /// Ordered transport candidates. At first open the client walks this
    /// list and pins the first candidate that connects; the pin holds for
    /// the lifetime of the client.
    pub transports: Vec<Arc<dyn TransportFactory>>,

    /// Retry policy applied to every operation. Defaults to
    /// [`ExponentialBackoff`] (100 ms initial, 10 s cap, unbounded
    /// attempts). Can be swapped at runtime with
    /// [`DeviceClient::set_retry_policy`](crate::DeviceClient::set_retry_policy).
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Bounds the cumulative time of a single logical operation,
    /// including its retries and backoff sleeps. Default: 4 minutes.
    pub operation_timeout: Duration,

    /// Passed through to the transport.
    pub keep_alive: Duration,

    /// Passed through to the transport.
    pub idle_timeout: Duration,

    /// Content metadata applied to outgoing messages that do not set
    /// their own.
    pub payload_convention: PayloadConvention,
}

impl ClientConfig {
    /// Create a configuration from the required identity fields, with all
    /// other options at their defaults.
    pub fn new_simple(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        sas_provider: Arc<dyn SasTokenProvider>,
    ) -> ClientConfig {
        ClientConfig {
            hostname: hostname.into(),
            port: 1883,
            device_id: device_id.into(),
            module_id: None,
            sas_provider,
            transports: default_transports(),
            retry_policy: Arc::new(ExponentialBackoff::default()),
            operation_timeout: Duration::from_secs(4 * 60),
            keep_alive: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            payload_convention: PayloadConvention::default(),
        }
    }
}

#[cfg(feature = "transport-mqtt")]
fn default_transports() -> Vec<Arc<dyn TransportFactory>> {
    vec![Arc::new(crate::transport::mqtt::MqttTransportFactory::tcp())]
}

#[cfg(not(feature = "transport-mqtt"))]
fn default_transports() -> Vec<Arc<dyn TransportFactory>> {
    Vec::new()
}
