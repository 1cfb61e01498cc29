//! Connect device applications to an IoT hub over pluggable message
//! transports.
//!
//! The crate's core is a pipeline of handlers between the application
//! and the wire:
//!
//! ```text
//! application → state → retry → error remap → protocol routing → transport
//! ```
//!
//! * the **state** stage owns the lifecycle state machine
//!   (`Closed → Opening → Open → Closing`), serializes concurrent opens,
//!   re-installs subscriptions after every reconnect, and runs the
//!   background task that watches for unexpected disconnects;
//! * the **retry** stage applies the configured [`RetryPolicy`] to every
//!   operation, with cooperative cancellation and an overall operation
//!   timeout;
//! * the **error remap** stage classifies heterogeneous transport errors
//!   into the single [`IotHubError`] taxonomy;
//! * the **protocol routing** stage walks the ordered transport
//!   candidates at first open and pins the first that connects.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use iothub_client::auth::StaticSasToken;
//! use iothub_client::{CancellationToken, ClientConfig, DeviceClient, TelemetryMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sas = StaticSasToken::new(
//!         std::env::var("IOTHUB_SAS_TOKEN")?,
//!         chrono::Utc::now() + chrono::Duration::hours(1),
//!     );
//!     let config = ClientConfig::new_simple("contoso.azure-devices.net", "device-1", Arc::new(sas));
//!     let client = DeviceClient::new(config)?;
//!
//!     client.set_connection_status_callback(|status, reason| {
//!         eprintln!("connection: {status:?} ({reason:?})");
//!     });
//!
//!     client.open(CancellationToken::new()).await?;
//!     client
//!         .send_telemetry(
//!             TelemetryMessage::new(r#"{"temperature": 21.5}"#),
//!             CancellationToken::new(),
//!         )
//!         .await?;
//!     client.close(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod callbacks;
mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod transport;

pub use client::DeviceClient;
pub use config::{ClientConfig, PayloadConvention};
pub use error::{ErrorCode, IotHubError};
pub use message::{
    DesiredPropertyUpdate, DirectMethodRequest, DirectMethodResponse, LockToken, ReceivedMessage,
    TelemetryMessage, TwinDocument, TwinUpdateResponse,
};
pub use retry::{ExponentialBackoff, NoRetry, RetryDecision, RetryPolicy};
pub use status::{ConnectionStatus, ConnectionStatusChangeReason};

// Operations take a cancellation token by value; re-exported so callers
// do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
