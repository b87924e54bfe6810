use std::{fmt, sync::Arc, time::Duration};

use http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::IntoUrl;
use serde::Serialize;

use crate::{
    classifier::{Classification, PendingRequest, ResponseClassifier},
    config::RefreshConfig,
    coordinator::{LogSignOut, RefreshCoordinator, SignOutHandler},
    credentials::{CredentialPair, CredentialStore},
    error::{RenewalError, Result},
    pipeline::{bearer_header, RequestPipeline},
    renewal::{HttpRenewalClient, Renewer},
};

/// Wrapper around `reqwest::Client` that attaches the current access token to
/// every request and transparently renews it when the server answers `401`.
///
/// All requests failing while a renewal is in flight wait for that single
/// renewal and are then replayed once with the new token. If renewal fails the
/// credentials are cleared, the [`SignOutHandler`] runs, and every waiting
/// request fails with the renewal error.
///
/// Designed to be a mostly drop-in replacement for `reqwest::Client`.
/// Uses `Arc` internally for cheap cloning.
pub struct HttpClient<R: Renewer = HttpRenewalClient> {
    inner: Arc<Inner<R>>,
}

struct Inner<R: Renewer> {
    client: reqwest::Client,
    pipeline: RequestPipeline,
    classifier: ResponseClassifier,
    coordinator: RefreshCoordinator<R>,
    store: Arc<CredentialStore>,
}

impl<R: Renewer> Clone for HttpClient<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Renewer> fmt::Debug for HttpClient<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("coordinator", &self.inner.coordinator)
            .field("classifier", &self.inner.classifier)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Creates a client renewing credentials at the endpoint configured in
    /// `config`.
    ///
    /// # Errors
    /// Fails if the renewal URL is invalid or the renewal HTTP client cannot be built.
    pub fn new(config: RefreshConfig, store: CredentialStore) -> Result<Self> {
        let renewer = HttpRenewalClient::from_config(&config)?;
        Ok(Self::builder(config, renewer).store(store).build())
    }
}

impl<R: Renewer> HttpClient<R> {
    /// Start building a client with a custom [`Renewer`].
    #[must_use]
    pub fn builder(config: RefreshConfig, renewer: R) -> HttpClientBuilder<R> {
        HttpClientBuilder::new(config, renewer)
    }

    /// The current credential pair, if signed in.
    #[must_use]
    pub fn credentials(&self) -> Option<CredentialPair> {
        self.inner.store.read()
    }

    /// Obtain the authorization header that is attached to requests right now.
    ///
    /// # Errors
    /// Returns an error if the stored access token cannot be used as a header value.
    pub fn authorization_header(&self) -> Result<Option<HeaderValue>> {
        self.inner.pipeline.authorization_header()
    }

    /// Installs a credential pair obtained from a sign-in.
    ///
    /// # Errors
    /// See [`RefreshCoordinator::sign_in`].
    pub fn sign_in(&self, pair: &CredentialPair) -> Result<()> {
        self.inner.coordinator.sign_in(pair)
    }

    /// Signs out explicitly, clearing the credentials.
    ///
    /// # Errors
    /// Returns an error if the persisted credentials could not be removed.
    pub fn sign_out(&self) -> Result<()> {
        self.inner.coordinator.sign_out()
    }

    /// The coordinator renewing credentials for this client.
    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator<R> {
        &self.inner.coordinator
    }

    /// Start building a `Request`.
    /// The authorization header is attached when the request is sent.
    pub fn request<U: IntoUrl>(&self, method: reqwest::Method, url: U) -> RequestBuilder<R> {
        RequestBuilder {
            client: self.clone(),
            builder: self.inner.client.request(method, url),
        }
    }

    /// Execute a `Request`, adding the authorization header if it is not already set.
    ///
    /// A `401` answer triggers a renewal and one replay of the request. The
    /// response of the replay is returned as is, even if it is another `401`.
    ///
    /// # Errors
    /// - Returns an error if the request fails.
    /// - Returns [`Error::Renewal`](crate::Error::Renewal) if the credentials had to be renewed and renewal failed.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        let inner = &self.inner;
        let mut pending = PendingRequest::capture(&request);
        let mut sent_with = inner.pipeline.attach(&mut request)?;
        let mut outcome = inner.pipeline.forward(request).await;

        loop {
            match inner.classifier.classify(&outcome, pending.as_ref()) {
                Classification::PassThrough | Classification::Abort => return outcome,
                Classification::Retryable => {}
            }
            let Some(pending) = pending.as_mut() else {
                return outcome;
            };
            pending.mark_retried();
            tracing::debug!(
                method = %pending.method(),
                path = pending.url().path(),
                "Credential expired. Waiting for renewal."
            );

            let access_token = match inner
                .coordinator
                .renewed_access_token(sent_with.as_deref())
                .await
            {
                Ok(access_token) => access_token,
                Err(e) => {
                    outcome = Err(e);
                    continue;
                }
            };

            let Some(mut replay) = pending.replay() else {
                return outcome;
            };
            replay
                .headers_mut()
                .insert(AUTHORIZATION, bearer_header(&access_token)?);
            sent_with = Some(access_token);
            outcome = inner.pipeline.dispatch(replay).await;
        }
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder<R> {
        self.request(reqwest::Method::HEAD, url)
    }
}

/// Builder for [`HttpClient`].
///
/// The following configurations are available:
/// * `store`: Where credentials are kept. Default is an in-memory store without credentials.
/// * `client`: Custom `reqwest::Client` for API requests. Default is `reqwest::Client::new()`.
/// * `sign_out`: Called once per failed renewal. Default only logs.
pub struct HttpClientBuilder<R: Renewer> {
    config: RefreshConfig,
    renewer: R,
    store: Option<CredentialStore>,
    client: Option<reqwest::Client>,
    sign_out: Option<Box<dyn SignOutHandler>>,
}

impl<R: Renewer> fmt::Debug for HttpClientBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientBuilder")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<R: Renewer> HttpClientBuilder<R> {
    #[must_use]
    pub fn new(config: RefreshConfig, renewer: R) -> Self {
        Self {
            config,
            renewer,
            store: None,
            client: None,
            sign_out: None,
        }
    }

    /// Set the credential store, typically opened on a durable storage.
    #[must_use]
    pub fn store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set a custom `reqwest::Client` for API requests.
    /// Renewal calls never use this client.
    #[must_use]
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the handler invoked once per failed renewal.
    #[must_use]
    pub fn sign_out(mut self, handler: impl SignOutHandler) -> Self {
        self.sign_out = Some(Box::new(handler));
        self
    }

    /// Build the [`HttpClient`].
    ///
    /// # Panics
    ///
    /// This method panics if [`Self::client`] was not called and `reqwest::Client::new()` panics.
    #[must_use]
    pub fn build(self) -> HttpClient<R> {
        let store = Arc::new(self.store.unwrap_or_else(CredentialStore::in_memory));
        let client = self.client.unwrap_or_default();
        let sign_out = self
            .sign_out
            .unwrap_or_else(|| Box::new(LogSignOut));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            self.renewer,
            self.config.renewal_timeout(),
            BoxedSignOut(sign_out),
        );

        HttpClient {
            inner: Arc::new(Inner {
                pipeline: RequestPipeline::new(client.clone(), store.clone()),
                classifier: ResponseClassifier::new(&self.config),
                client,
                coordinator,
                store,
            }),
        }
    }
}

struct BoxedSignOut(Box<dyn SignOutHandler>);

impl SignOutHandler for BoxedSignOut {
    fn sign_out(&self, reason: &RenewalError) {
        self.0.sign_out(reason);
    }
}

/// A request being built for an [`HttpClient`].
///
/// Mirrors `reqwest::RequestBuilder`; [`send`](Self::send) goes through the
/// renewing client.
pub struct RequestBuilder<R: Renewer = HttpRenewalClient> {
    client: HttpClient<R>,
    builder: reqwest::RequestBuilder,
}

impl<R: Renewer> fmt::Debug for RequestBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

impl<R: Renewer> RequestBuilder<R> {
    /// Add a header to the request.
    #[must_use]
    pub fn header<K, V>(self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.map(|builder| builder.header(key, value))
    }

    /// Add a set of headers to the request.
    #[must_use]
    pub fn headers(self, headers: HeaderMap) -> Self {
        self.map(|builder| builder.headers(headers))
    }

    /// Modify the query string of the URL.
    #[must_use]
    pub fn query<T: Serialize + ?Sized>(self, query: &T) -> Self {
        self.map(|builder| builder.query(query))
    }

    /// Send a JSON body.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(self, json: &T) -> Self {
        self.map(|builder| builder.json(json))
    }

    /// Set the request body.
    #[must_use]
    pub fn body<T: Into<reqwest::Body>>(self, body: T) -> Self {
        self.map(|builder| builder.body(body))
    }

    /// Set a timeout for this request, including its replay after a renewal.
    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        self.map(|builder| builder.timeout(timeout))
    }

    /// Build the `Request` without sending it.
    ///
    /// # Errors
    /// Returns an error if the request is invalid, e.g. has a malformed URL.
    pub fn build(self) -> Result<reqwest::Request> {
        Ok(self.builder.build()?)
    }

    /// Send the request through the [`HttpClient`].
    ///
    /// # Errors
    /// See [`HttpClient::execute`].
    pub async fn send(self) -> Result<reqwest::Response> {
        let request = self.builder.build()?;
        self.client.execute(request).await
    }

    fn map(self, f: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder) -> Self {
        Self {
            client: self.client,
            builder: f(self.builder),
        }
    }
}
