//! Credential seam.
//!
//! The pipeline never mints credentials itself; a [`SasTokenProvider`]
//! supplies a shared-access-signature token whenever a transport connects
//! or the application asks for a refresh. X.509 and other schemes live in
//! the transport adapters and are out of scope here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// A shared-access-signature token plus its expiry instant.
#[derive(Debug, Clone)]
pub struct SasToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SasTokenError {
    /// The token source could not be reached; retrying may help.
    #[error("network failure obtaining SAS token: {0}")]
    Network(String),
    /// The token source refused the request; retrying will not help.
    #[error("SAS token request rejected: {0}")]
    Rejected(String),
}

/// Issues a credential every time a transport needs to authenticate.
///
/// Implementations are queried on every connection attempt, so a provider
/// backed by a token service hands out a fresh token per reconnect
/// without any bookkeeping in the pipeline.
#[async_trait]
pub trait SasTokenProvider: fmt::Debug + Send + Sync {
    async fn get_token(&self) -> Result<SasToken, SasTokenError>;
}

/// Simplest possible provider: a pre-issued token used as-is.
#[derive(Debug, Clone)]
pub struct StaticSasToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl StaticSasToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        StaticSasToken {
            token: token.into(),
            expires_at,
        }
    }
}

#[async_trait]
impl SasTokenProvider for StaticSasToken {
    async fn get_token(&self) -> Result<SasToken, SasTokenError> {
        Ok(SasToken {
            token: self.token.clone(),
            expires_at: self.expires_at,
        })
    }
}
