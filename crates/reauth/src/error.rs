use std::{sync::Arc, time::Duration};

use http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("Token cannot be used as a header value. Must be ASCII.")]
    InvalidHeaderValue,
    #[error("Request failed: {0}")]
    ReqwestFailed(#[from] Arc<reqwest::Error>),
    #[error("Credential renewal failed: {0}")]
    Renewal(#[from] RenewalError),
    #[error("Credential pair must contain a non-empty access and refresh token")]
    IncompleteCredentials,
    #[error("Failed to persist credentials: {0}")]
    Persistence(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// `true` if this error ended the session: the credential pair was cleared
    /// and the user must authenticate again.
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::Renewal(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::ReqwestFailed(Arc::new(value))
    }
}

/// Reasons a refresh token could not be exchanged for a new credential pair.
///
/// Every waiter parked on a renewal cycle receives a clone of the same value.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No refresh token available")]
    MissingRefreshToken,
    #[error("Request to renew credentials failed: {0}")]
    RequestFailed(String),
    #[error("Renewal endpoint responded with status {0}")]
    Status(StatusCode),
    #[error("Failed to parse renewal response: {0}")]
    ParseError(String),
    #[error("Renewal response does not contain an access token")]
    MissingAccessToken,
    #[error("Renewed access token cannot be used as a header value")]
    InvalidAccessToken,
    #[error("Renewal did not complete within {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Renewal was interrupted before it completed")]
    Interrupted,
    #[error("Session ended while the request was in flight")]
    SessionEnded,
}
