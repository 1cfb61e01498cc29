//! Data types carried through the pipeline.
//!
//! The pipeline treats payloads as opaque bytes (telemetry, C2D) or JSON
//! documents (twin, direct methods); no payload convention is interpreted
//! here beyond stamping content metadata on outgoing messages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;

/// Application property bag; most messages carry only a handful of pairs.
pub type PropertyBag = SmallVec<[(String, String); 4]>;

/// A device-to-cloud telemetry message.
#[derive(Debug, Clone, Default)]
pub struct TelemetryMessage {
    pub payload: Bytes,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Routes module telemetry to a named output; ignored for devices.
    pub output_name: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub properties: PropertyBag,
}

impl TelemetryMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        TelemetryMessage {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Identifies a received message for settlement (complete/abandon/reject).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        LockToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A cloud-to-device (or module input) message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub lock_token: LockToken,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Set when the message arrived on a module input.
    pub input_name: Option<String>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub properties: PropertyBag,
}

/// The full device twin: desired and reported property documents.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct TwinDocument {
    #[serde(default)]
    pub desired: serde_json::Value,
    #[serde(default)]
    pub reported: serde_json::Value,
}

/// Outcome of a reported-properties update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwinUpdateResponse {
    /// Version the reported document advanced to.
    pub version: i64,
}

/// A desired-property change pushed by the service.
#[derive(Debug, Clone)]
pub struct DesiredPropertyUpdate {
    pub patch: serde_json::Value,
    pub version: Option<i64>,
}

/// A direct method invocation from the service.
#[derive(Debug, Clone)]
pub struct DirectMethodRequest {
    pub name: String,
    /// Correlator the response must echo back.
    pub request_id: String,
    pub payload: serde_json::Value,
}

/// The application's answer to a direct method invocation.
#[derive(Debug, Clone)]
pub struct DirectMethodResponse {
    pub request_id: String,
    pub status: i32,
    pub payload: serde_json::Value,
}

impl DirectMethodResponse {
    pub fn new(request_id: impl Into<String>, status: i32, payload: serde_json::Value) -> Self {
        DirectMethodResponse {
            request_id: request_id.into(),
            status,
            payload,
        }
    }
}
