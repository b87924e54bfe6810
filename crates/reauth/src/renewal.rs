//! Exchanges a refresh token for a new credential pair.
use std::future::Future;

use serde_json::Value;
use url::Url;

use crate::{
    config::RefreshConfig,
    credentials::CredentialPair,
    error::{RenewalError, Result},
    pipeline::bearer_header,
};

/// Performs the out-of-band renewal call.
///
/// Implementations must not route the call through an [`HttpClient`](crate::HttpClient):
/// a renewal endpoint answering `401` would otherwise trigger another renewal.
pub trait Renewer: Send + Sync + 'static {
    /// Exchanges `refresh_token` for a new pair.
    ///
    /// # Errors
    /// Fails with a [`RenewalError`] if the token is empty, the call fails or
    /// the response carries no usable access token.
    fn renew(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = std::result::Result<CredentialPair, RenewalError>> + Send;
}

/// Default [`Renewer`]: `POST {base}/auth/refresh-token` with `{"refreshToken": ..}`.
///
/// Uses its own `reqwest::Client`, so no bearer header is ever attached to the
/// renewal call.
#[derive(Debug, Clone)]
pub struct HttpRenewalClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpRenewalClient {
    /// Creates a renewal client for the endpoint configured in `config`.
    /// The underlying client does not follow redirects.
    ///
    /// # Errors
    /// Fails if the renewal URL is invalid or the HTTP client cannot be built.
    pub fn from_config(config: &RefreshConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::with_client(config.refresh_url()?, client))
    }

    /// Use a custom `reqwest::Client` for renewal calls.
    /// When setting a custom client, please make sure to set the `redirect`
    /// policy to `Policy::none()`.
    #[must_use]
    pub fn with_client(url: Url, client: reqwest::Client) -> Self {
        Self { client, url }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Renewer for HttpRenewalClient {
    #[tracing::instrument(name = "renew_credentials", skip_all, fields(url = %self.url))]
    async fn renew(&self, refresh_token: &str) -> std::result::Result<CredentialPair, RenewalError> {
        if refresh_token.is_empty() {
            return Err(RenewalError::MissingRefreshToken);
        }

        let response = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| RenewalError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RenewalError::Status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RenewalError::ParseError(e.to_string()))?;

        let pair = parse_renewal_response(&body, refresh_token)?;
        tracing::debug!("Renewal endpoint issued a new credential pair");
        Ok(pair)
    }
}

/// Reads the new pair from a renewal response.
///
/// The tokens may sit at the top level or under `data`. A missing or empty
/// `refreshToken` keeps `previous_refresh_token`: rotation is optional.
pub(crate) fn parse_renewal_response(
    body: &Value,
    previous_refresh_token: &str,
) -> std::result::Result<CredentialPair, RenewalError> {
    let payload = body
        .get("data")
        .filter(|data| data.get("accessToken").is_some())
        .unwrap_or(body);

    let access_token = payload
        .get("accessToken")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .ok_or(RenewalError::MissingAccessToken)?;

    bearer_header(access_token).map_err(|_| RenewalError::InvalidAccessToken)?;

    let refresh_token = payload
        .get("refreshToken")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .unwrap_or(previous_refresh_token);

    Ok(CredentialPair::new(access_token, refresh_token))
}
