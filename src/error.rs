use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::transport::TransportError;

/// The closed set of error kinds surfaced by the client.
///
/// Every error leaving the pipeline carries exactly one of these codes;
/// raw transport errors never escape (they are remapped by the error
/// remapping stage of the pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Connection-level failure (reset, refused, timed out on the wire).
    NetworkErrors,
    /// The service asked the client to slow down; safe to retry later.
    Throttled,
    /// The service is temporarily unavailable.
    ServerBusy,
    /// The peer sent a frame the client could not interpret, or rejected
    /// a request as malformed.
    IotHubFormatError,
    /// Authentication or authorization failed.
    Unauthorized,
    /// The device or module identity does not exist.
    DeviceNotFound,
    /// The device identity exists but has been disabled.
    DeviceDisabled,
    /// The message exceeds the maximum size accepted by the service.
    MessageTooLarge,
    /// A message lock token was no longer valid when it was used.
    PreconditionFailed,
    /// TLS negotiation failed while connecting.
    TlsAuthenticationError,
    /// The hub's daily quota has been exhausted.
    IotHubQuotaExceeded,
    /// The operation was cancelled by the caller or by `close`.
    OperationCancelled,
    /// The operation exceeded the configured operation timeout.
    OperationTimedOut,
    /// The client instance has been disposed.
    ClientDisposed,
    /// An operation was invoked before the client was opened.
    ClientNotOpened,
    /// The client was driven through an illegal lifecycle transition.
    InvalidClientState,
    /// Anything the taxonomy cannot place.
    Unknown,
}

impl ErrorCode {
    /// Whether errors of this kind may resolve by retrying unchanged.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkErrors
                | ErrorCode::Throttled
                | ErrorCode::ServerBusy
                | ErrorCode::OperationTimedOut
        )
    }
}

/// The unified error type exposed by every public operation.
///
/// Carries the classified [`ErrorCode`], the transient flag, an optional
/// service-side tracking id for support diagnostics, and the original
/// cause when one exists.
#[derive(Debug)]
pub struct IotHubError {
    code: ErrorCode,
    is_transient: bool,
    message: String,
    tracking_id: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl IotHubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        IotHubError {
            code,
            is_transient: code.is_transient(),
            message: message.into(),
            tracking_id: None,
            source: None,
        }
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Error reported when the caller (or an internal `close`) cancelled
    /// the operation.
    pub fn cancelled() -> Self {
        IotHubError::new(ErrorCode::OperationCancelled, "the operation was cancelled")
    }

    /// Error reported when the cumulative operation timeout elapsed.
    pub fn timed_out(after: Duration) -> Self {
        IotHubError::new(
            ErrorCode::OperationTimedOut,
            format!("the operation did not complete within {after:?}"),
        )
    }

    pub fn disposed() -> Self {
        IotHubError::new(ErrorCode::ClientDisposed, "the client has been disposed")
    }

    pub fn not_opened() -> Self {
        IotHubError::new(
            ErrorCode::ClientNotOpened,
            "the client must be opened before invoking this operation",
        )
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        IotHubError::new(ErrorCode::InvalidClientState, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn tracking_id(&self) -> Option<&str> {
        self.tracking_id.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for IotHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(tracking_id) = &self.tracking_id {
            write!(f, " (tracking id: {tracking_id})")?;
        }
        Ok(())
    }
}

impl StdError for IotHubError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn StdError + 'static))
    }
}

/// Classification of a raw transport error into the unified taxonomy.
pub(crate) fn classify(error: &TransportError) -> ErrorCode {
    match error {
        TransportError::Io(_) | TransportError::Network(_) | TransportError::Timeout => {
            ErrorCode::NetworkErrors
        }
        TransportError::Throttled { .. } => ErrorCode::Throttled,
        TransportError::ServerBusy { .. } => ErrorCode::ServerBusy,
        TransportError::Protocol { .. } => ErrorCode::IotHubFormatError,
        TransportError::Unauthorized { .. } => ErrorCode::Unauthorized,
        TransportError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
        TransportError::DeviceDisabled { .. } => ErrorCode::DeviceDisabled,
        TransportError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
        TransportError::LockLost(_) => ErrorCode::PreconditionFailed,
        TransportError::Tls(_) => ErrorCode::TlsAuthenticationError,
        TransportError::QuotaExceeded { .. } => ErrorCode::IotHubQuotaExceeded,
        TransportError::Other(_) => ErrorCode::Unknown,
    }
}

impl From<TransportError> for IotHubError {
    fn from(error: TransportError) -> Self {
        let code = classify(&error);
        let tracking_id = error.tracking_id().map(str::to_owned);
        let mut unified = IotHubError::new(code, error.to_string()).with_source(error);
        if let Some(tracking_id) = tracking_id {
            unified = unified.with_tracking_id(tracking_id);
        }
        unified
    }
}
