use std::sync::Arc;

use http::{header::AUTHORIZATION, HeaderValue};

use crate::{
    credentials::CredentialStore,
    error::{Error, Result},
};

/// Builds the `Bearer` authorization header for `token`.
/// Pass only the token, without the `Bearer` prefix.
///
/// # Errors
/// Fails if "Bearer {token}" is not a valid ASCII header value.
pub(crate) fn bearer_header(token: &str) -> Result<HeaderValue> {
    require_ascii(token)?;
    let mut header =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_e| Error::InvalidHeaderValue)?;
    header.set_sensitive(true);
    Ok(header)
}

/// Helper function to ensure that a string is ASCII.
///
/// # Errors
/// Fails with `InvalidHeaderValue` if the string is not ASCII.
fn require_ascii(s: &str) -> Result<()> {
    if s.is_ascii() {
        Ok(())
    } else {
        Err(Error::InvalidHeaderValue)
    }
}

/// Attaches the current access token to outbound requests and sends them.
///
/// Performs no retries and does not look at responses.
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    client: reqwest::Client,
    store: Arc<CredentialStore>,
}

impl RequestPipeline {
    pub fn new(client: reqwest::Client, store: Arc<CredentialStore>) -> Self {
        Self { client, store }
    }

    /// The header that would be attached right now, `None` if signed out.
    ///
    /// # Errors
    /// Fails if the stored access token cannot be used as a header value.
    pub fn authorization_header(&self) -> Result<Option<HeaderValue>> {
        self.store
            .read()
            .map(|pair| bearer_header(pair.access_token()))
            .transpose()
    }

    /// Attaches the current access token unless the request already carries an
    /// `Authorization` header. Returns the attached access token.
    ///
    /// Without a stored pair the request is left unauthenticated.
    ///
    /// # Errors
    /// Fails if the stored access token cannot be used as a header value.
    pub fn attach(&self, request: &mut reqwest::Request) -> Result<Option<String>> {
        if request.headers().contains_key(AUTHORIZATION) {
            return Ok(None);
        }
        let Some(pair) = self.store.read() else {
            return Ok(None);
        };
        request
            .headers_mut()
            .insert(AUTHORIZATION, bearer_header(pair.access_token())?);
        Ok(Some(pair.access_token().to_string()))
    }

    /// Sends `request` as is.
    ///
    /// # Errors
    /// Fails if the request could not be sent.
    pub async fn forward(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.client
            .execute(request)
            .await
            .map_err(Arc::new)
            .map_err(Into::into)
    }

    /// Attaches the current credential and sends the request.
    ///
    /// # Errors
    /// - Fails if the stored access token cannot be used as a header value.
    /// - Fails if the request could not be sent.
    pub async fn dispatch(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        self.attach(&mut request)?;
        self.forward(request).await
    }
}
