//! Application-observable connection status.
//!
//! Distinct from the internal transport state: status conveys intent and
//! recoverability (is the client retrying? did it give up and why?), not
//! the low-level lifecycle transition.

use std::sync::{Arc, Mutex};

use tracing::debug;

/// Connection state reported outward to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The client is not open (never opened, or closed by the application).
    Disabled,
    /// The connection was lost and the client is not trying to recover.
    Disconnected,
    /// The connection was lost and the client is reconnecting.
    DisconnectedRetrying,
    /// The client is connected and operational.
    Connected,
}

/// Why the status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusChangeReason {
    ConnectionOk,
    ClientClose,
    CommunicationError,
    RetryExpired,
    BadCredential,
    DeviceDisabled,
}

/// Callback invoked on every status transition. Must not block.
pub type ConnectionStatusCallback =
    Arc<dyn Fn(ConnectionStatus, ConnectionStatusChangeReason) + Send + Sync>;

/// Fans status transitions out to the registered callback.
///
/// Consecutive identical `(status, reason)` pairs are suppressed so that
/// reconnect churn does not replay the same notification.
#[derive(Clone, Default)]
pub(crate) struct ConnectionStatusNotifier {
    inner: Arc<NotifierInner>,
}

#[derive(Default)]
struct NotifierInner {
    callback: Mutex<Option<ConnectionStatusCallback>>,
    last: Mutex<Option<(ConnectionStatus, ConnectionStatusChangeReason)>>,
}

impl std::fmt::Debug for ConnectionStatusNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStatusNotifier")
            .field("last", &*self.inner.last.lock().unwrap())
            .finish()
    }
}

impl ConnectionStatusNotifier {
    pub fn set_callback(&self, callback: ConnectionStatusCallback) {
        *self.inner.callback.lock().unwrap() = Some(callback);
    }

    pub fn emit(&self, status: ConnectionStatus, reason: ConnectionStatusChangeReason) {
        {
            let mut last = self.inner.last.lock().unwrap();
            if *last == Some((status, reason)) {
                return;
            }
            *last = Some((status, reason));
        }
        debug!(?status, ?reason, "connection status changed");
        let callback = self.inner.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(status, reason);
        }
    }
}
