//! Decides which failures are answered with a credential renewal.
use http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode};
use url::Url;

use crate::{config::RefreshConfig, error::Result};

/// Outcome of [`ResponseClassifier::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Hand the outcome to the caller unchanged.
    PassThrough,
    /// The credential expired: renew it and replay the request once.
    Retryable,
    /// Renewal failed and the session is gone. The caller receives the
    /// renewal error and must authenticate again.
    Abort,
}

/// A replayable copy of a request, taken before any credential is attached.
#[derive(Debug)]
pub struct PendingRequest {
    request: reqwest::Request,
    retried: bool,
}

impl PendingRequest {
    /// Captures `request`. Returns `None` if its body is a stream and cannot
    /// be replayed.
    #[must_use]
    pub fn capture(request: &reqwest::Request) -> Option<Self> {
        request.try_clone().map(|request| Self {
            request,
            retried: false,
        })
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        self.request.url()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.request.body().and_then(reqwest::Body::as_bytes)
    }

    /// `true` once the request has been replayed after a renewal.
    #[must_use]
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// A fresh copy of the original request to send again.
    pub(crate) fn replay(&self) -> Option<reqwest::Request> {
        self.request.try_clone()
    }
}

/// Separates expired-credential failures from everything else.
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    config: RefreshConfig,
}

impl ResponseClassifier {
    #[must_use]
    pub fn new(config: &RefreshConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Classifies the outcome of sending `request`.
    ///
    /// Rules, in order:
    /// 1. Renewal failures abort.
    /// 2. Anything but a `401`, or a request that cannot be replayed, passes through.
    /// 3. Requests to credential-issuing endpoints pass through.
    /// 4. Requests that were already replayed once pass through.
    /// 5. Requests that carried a caller-supplied `Authorization` header pass through.
    /// 6. Everything else is retryable.
    #[must_use]
    pub fn classify(
        &self,
        outcome: &Result<reqwest::Response>,
        request: Option<&PendingRequest>,
    ) -> Classification {
        let status = match outcome {
            Ok(response) => response.status(),
            Err(e) if e.is_session_expired() => return Classification::Abort,
            Err(_) => return Classification::PassThrough,
        };
        self.classify_status(status, request)
    }

    fn classify_status(
        &self,
        status: StatusCode,
        request: Option<&PendingRequest>,
    ) -> Classification {
        if status != StatusCode::UNAUTHORIZED {
            return Classification::PassThrough;
        }
        let Some(request) = request else {
            tracing::warn!("Received 401 for a request with a streaming body. Not retrying.");
            return Classification::PassThrough;
        };

        let path = request.url().path();
        if self.config.is_excluded(path) {
            tracing::debug!(path, "Received 401 from an authentication endpoint. Not renewing.");
            return Classification::PassThrough;
        }
        if request.is_retried() {
            tracing::warn!(path, "Received 401 after renewing credentials. Giving up.");
            return Classification::PassThrough;
        }
        if request.headers().contains_key(AUTHORIZATION) {
            return Classification::PassThrough;
        }

        Classification::Retryable
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::{Error, RenewalError};

    fn classifier() -> ResponseClassifier {
        ResponseClassifier::new(
            &RefreshConfig::builder()
                .base_url("https://api.example.com".parse().unwrap())
                .build(),
        )
    }

    fn pending(path: &str) -> PendingRequest {
        let request = reqwest::Request::new(
            Method::GET,
            format!("https://api.example.com{path}").parse().unwrap(),
        );
        PendingRequest::capture(&request).unwrap()
    }

    #[test]
    fn test_expired_credential_is_retryable() {
        let request = pending("/rewards");
        assert_eq!(
            classifier().classify_status(StatusCode::UNAUTHORIZED, Some(&request)),
            Classification::Retryable
        );
    }

    #[test]
    fn test_other_statuses_pass_through() {
        let request = pending("/rewards");
        for status in [
            StatusCode::OK,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert_eq!(
                classifier().classify_status(status, Some(&request)),
                Classification::PassThrough,
                "{status}"
            );
        }
    }

    #[test]
    fn test_authentication_endpoints_pass_through() {
        for path in [
            "/auth/login",
            "/auth/register",
            "/auth/active-account",
            "/auth/refresh-token",
        ] {
            assert_eq!(
                classifier().classify_status(StatusCode::UNAUTHORIZED, Some(&pending(path))),
                Classification::PassThrough,
                "{path}"
            );
        }
    }

    #[test]
    fn test_retried_request_passes_through() {
        let mut request = pending("/rewards");
        request.mark_retried();
        assert_eq!(
            classifier().classify_status(StatusCode::UNAUTHORIZED, Some(&request)),
            Classification::PassThrough
        );
    }

    #[test]
    fn test_caller_supplied_authorization_passes_through() {
        let mut request = reqwest::Request::new(
            Method::GET,
            "https://api.example.com/rewards".parse().unwrap(),
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        let request = PendingRequest::capture(&request).unwrap();

        assert_eq!(
            classifier().classify_status(StatusCode::UNAUTHORIZED, Some(&request)),
            Classification::PassThrough
        );
    }

    #[test]
    fn test_without_request_context_passes_through() {
        assert_eq!(
            classifier().classify_status(StatusCode::UNAUTHORIZED, None),
            Classification::PassThrough
        );
    }

    #[test]
    fn test_renewal_failure_aborts() {
        let outcome = Err(Error::Renewal(RenewalError::MissingRefreshToken));
        assert_eq!(
            classifier().classify(&outcome, Some(&pending("/rewards"))),
            Classification::Abort
        );

        let outcome = Err(Error::Persistence("unrelated".to_string()));
        assert_eq!(
            classifier().classify(&outcome, Some(&pending("/rewards"))),
            Classification::PassThrough
        );
    }

    #[test]
    fn test_pending_request_keeps_body() {
        let mut request = reqwest::Request::new(
            Method::POST,
            "https://api.example.com/staff".parse().unwrap(),
        );
        *request.body_mut() = Some(reqwest::Body::from("{\"name\":\"Jo\"}"));
        let pending = PendingRequest::capture(&request).unwrap();

        assert_eq!(pending.method(), &Method::POST);
        assert_eq!(pending.body(), Some(&b"{\"name\":\"Jo\"}"[..]));
        let replay = pending.replay().unwrap();
        assert_eq!(replay.url().path(), "/staff");
    }
}
