//! Error types for the delivery engine
//!
//! Construction and configuration problems surface as `AppError`.
//! Everything the HTTP client can return from a send attempt is a
//! `ClientError`; the client never interprets them, the delivery worker
//! classifies them.

use thiserror::Error;

use crate::httpclient::sanitizer::ReservedAddr;

/// Application-wide error type
///
/// Returned while loading configuration, building the HTTP client or
/// starting the operations endpoint.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization error (delivery records)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted delivery record could not be turned back into a request
    #[error("Invalid delivery record: {0}")]
    InvalidRecord(String),

    /// I/O error (listener, signals)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors returned by a single send attempt of the safe HTTP client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Destination resolved to an address forbidden by the sanitizer
    #[error(transparent)]
    ReservedAddr(#[from] ReservedAddr),

    /// Response body larger than the configured cap
    #[error("response body exceeds limit of {limit} bytes")]
    BodyTooLarge {
        /// Configured maximum body size
        limit: u64,
    },

    /// Request could not be sent as given (scheme, host, headers)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The attached signer refused to sign the outgoing request
    #[error("request signing failed: {0}")]
    Signing(String),

    /// The caller's cancellation token fired first
    #[error("request cancelled")]
    Cancelled,

    /// Transport, dial, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    /// Map a transport error, lifting sanitizer rejections raised inside the
    /// resolver or redirect policy back out of the `reqwest` error chain.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(&err);
        while let Some(inner) = source {
            if let Some(reserved) = inner.downcast_ref::<ReservedAddr>() {
                return ClientError::ReservedAddr(reserved.clone());
            }
            source = inner.source();
        }
        ClientError::Transport(err)
    }

    /// Whether this error was caused by cancellation of the caller
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}
