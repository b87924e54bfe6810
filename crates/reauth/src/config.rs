use std::time::Duration;

use typed_builder::TypedBuilder;
use url::Url;

/// Path of the renewal endpoint, relative to the base URL.
pub const DEFAULT_REFRESH_PATH: &str = "auth/refresh-token";

/// Requests whose path contains one of these never trigger a renewal.
/// They issue or renew credentials themselves.
pub const DEFAULT_EXCLUDED_PATHS: [&str; 4] = [
    "/auth/login",
    "/auth/register",
    "/auth/active-account",
    "/auth/refresh",
];

pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of an [`HttpClient`](crate::HttpClient).
///
/// ```
/// # use std::time::Duration;
/// let config = reauth::RefreshConfig::builder()
///     .base_url("https://api.example.com/v1/".parse().unwrap())
///     .renewal_timeout(Duration::from_secs(10))
///     .build();
/// assert_eq!(
///     config.refresh_url().unwrap().as_str(),
///     "https://api.example.com/v1/auth/refresh-token"
/// );
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct RefreshConfig {
    /// Base URL of the API. The renewal endpoint is resolved against it.
    base_url: Url,
    #[builder(default = DEFAULT_REFRESH_PATH.to_string(), setter(into))]
    refresh_path: String,
    #[builder(default = DEFAULT_EXCLUDED_PATHS.iter().map(ToString::to_string).collect())]
    excluded_paths: Vec<String>,
    /// Upper bound for a single renewal call. A renewal that takes longer
    /// fails and ends the session.
    #[builder(default = DEFAULT_RENEWAL_TIMEOUT)]
    renewal_timeout: Duration,
}

impl RefreshConfig {
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn renewal_timeout(&self) -> Duration {
        self.renewal_timeout
    }

    #[must_use]
    pub fn excluded_paths(&self) -> &[String] {
        &self.excluded_paths
    }

    /// Absolute URL of the renewal endpoint.
    ///
    /// The base URL is treated as a directory even without a trailing slash.
    ///
    /// # Errors
    /// Fails if the refresh path cannot be joined onto the base URL.
    pub fn refresh_url(&self) -> Result<Url, url::ParseError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(self.refresh_path.trim_start_matches('/'))
    }

    /// `true` if failures on `path` must never trigger a renewal.
    ///
    /// The configured renewal path is always excluded.
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        let refresh_path = format!("/{}", self.refresh_path.trim_start_matches('/'));
        path.contains(&refresh_path)
            || self
                .excluded_paths
                .iter()
                .any(|pattern| path.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(base: &str) -> RefreshConfig {
        RefreshConfig::builder()
            .base_url(base.parse().unwrap())
            .build()
    }

    #[test]
    fn test_refresh_url_keeps_base_path() {
        assert_eq!(
            config("https://api.example.com/v1").refresh_url().unwrap().as_str(),
            "https://api.example.com/v1/auth/refresh-token"
        );
        assert_eq!(
            config("https://api.example.com").refresh_url().unwrap().as_str(),
            "https://api.example.com/auth/refresh-token"
        );
    }

    #[test]
    fn test_bootstrap_endpoints_are_excluded() {
        let config = config("https://api.example.com");
        for path in [
            "/auth/login",
            "/v1/auth/register",
            "/auth/active-account/abc",
            "/auth/refresh-token",
        ] {
            assert!(config.is_excluded(path), "{path} should be excluded");
        }
        assert!(!config.is_excluded("/rewards"));
        assert!(!config.is_excluded("/auth/profile"));
    }

    #[test]
    fn test_custom_refresh_path_is_excluded() {
        let config = RefreshConfig::builder()
            .base_url("https://api.example.com/v1".parse().unwrap())
            .refresh_path("token/renew")
            .excluded_paths(vec![])
            .build();
        assert!(config.is_excluded("/v1/token/renew"));
        assert!(!config.is_excluded("/v1/token"));
        assert!(!config.is_excluded("/v1/auth/login"));
    }

    #[test]
    fn test_defaults() {
        let config = config("https://api.example.com");
        assert_eq!(config.renewal_timeout(), DEFAULT_RENEWAL_TIMEOUT);
        assert_eq!(config.excluded_paths().len(), DEFAULT_EXCLUDED_PATHS.len());
    }
}
