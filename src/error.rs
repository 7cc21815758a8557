//! Error types surfaced by the engine and published in [`State::Error`].
//!
//! [`State::Error`]: crate::auth::State::Error

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building requests, talking to an authorization
/// server, or persisting credentials.
///
/// Payloads are plain strings so the error can be cloned into published
/// state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A request could not be formed from the provider configuration.
    #[error("malformed url: {0}")]
    MalformedUrl(String),

    /// Transport failure or a non-success response from the server.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The response body did not match the expected schema.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// Persisting, reading, or deleting a credential failed.
    #[error("credential store failure: {0}")]
    CredentialStore(String),

    /// The callback `state` did not match the pending authorization.
    #[error("state mismatch in authorization callback")]
    StateMismatch,

    /// The user or server refused the authorization.
    #[error("authorization denied: {0}")]
    AccessDenied(String),

    /// No provider with the given id is configured.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The operation was invalidated by `clear()` while in flight.
    #[error("operation cancelled")]
    Cancelled,
}

/// Discriminant of [`Error`] for cheap matching by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedUrl,
    BadResponse,
    Decoding,
    CredentialStore,
    StateMismatch,
    AccessDenied,
    UnknownProvider,
    Cancelled,
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedUrl(_) => ErrorKind::MalformedUrl,
            Self::BadResponse(_) => ErrorKind::BadResponse,
            Self::Decoding(_) => ErrorKind::Decoding,
            Self::CredentialStore(_) => ErrorKind::CredentialStore,
            Self::StateMismatch => ErrorKind::StateMismatch,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::UnknownProvider(_) => ErrorKind::UnknownProvider,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::MalformedUrl(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::BadResponse("request timed out".to_string())
        } else if err.is_connect() {
            Self::BadResponse(format!("connection failed: {}", err))
        } else {
            Self::BadResponse(err.to_string())
        }
    }
}
