//! HTTP client for storefront sessions with rate limiting and error handling
//!
//! Every storefront session gets its own [`HttpClient`] (own cookie jar, so
//! its own cart) while all of them share one [`SharedRateLimiter`], keeping
//! the total request rate within the configured budget.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState, state::direct::NotKeyed};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::crawling::session::SessionError;
use crate::infrastructure::config::StorefrontConfig;

pub type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// HTTP client configuration for one storefront
#[derive(Debug, Clone, serde::Serialize)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_requests_per_second: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::from(&StorefrontConfig::default())
    }
}

impl From<&StorefrontConfig> for HttpClientConfig {
    fn from(config: &StorefrontConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout_seconds: config.request_timeout_seconds,
            max_requests_per_second: config.max_requests_per_second,
        }
    }
}

impl HttpClientConfig {
    /// Builds the limiter shared by every session of a run
    pub fn rate_limiter(&self) -> Result<SharedRateLimiter, SessionError> {
        let per_second = NonZeroU32::new(self.max_requests_per_second)
            .ok_or_else(|| SessionError::InvalidInput("Rate limit must be greater than 0".to_string()))?;
        Ok(Arc::new(RateLimiter::direct(Quota::per_second(per_second))))
    }
}

/// Cookie-keeping HTTP client bound to one storefront session
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    rate_limiter: SharedRateLimiter,
    config: HttpClientConfig,
}

impl HttpClient {
    /// Create a new client with a fresh cookie jar
    pub fn new(config: HttpClientConfig, rate_limiter: SharedRateLimiter) -> Result<Self, SessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| SessionError::InvalidInput(format!("Invalid user agent: {e}")))?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| SessionError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            rate_limiter,
            config,
        })
    }

    /// Fetch a page and return its body
    pub async fn get_text(&self, url: &str) -> Result<String, SessionError> {
        let response = self.send(self.client.get(url), url).await?;
        let text = response
            .text()
            .await
            .map_err(|e| classify(&e, url))?;
        tracing::debug!("Successfully fetched: {} ({} chars)", url, text.len());
        Ok(text)
    }

    /// GET a JSON document
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SessionError> {
        let request = self.client.get(url).header(ACCEPT, "application/json");
        decode(self.send(request, url).await?, url).await
    }

    /// POST a form and decode the JSON answer
    pub async fn post_form<T: DeserializeOwned>(&self, url: &str, form: &[(String, String)]) -> Result<T, SessionError> {
        let request = self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .form(form);
        decode(self.send(request, url).await?, url).await
    }

    /// DELETE a resource; a 404 counts as already deleted
    pub async fn delete(&self, url: &str) -> Result<(), SessionError> {
        match self.send(self.client.request(Method::DELETE, url), url).await {
            Ok(_) | Err(SessionError::Http { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, SessionError> {
        self.rate_limiter.until_ready().await;
        tracing::trace!("Requesting {}", url);

        let response = request.send().await.map_err(|e| classify(&e, url))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(status_error(status, url))
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").field("config", &self.config).finish_non_exhaustive()
    }
}

async fn decode<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, SessionError> {
    let body = response.bytes().await.map_err(|e| classify(&e, url))?;
    serde_json::from_slice(&body).map_err(|e| SessionError::Extraction(format!("Unexpected JSON from {url}: {e}")))
}

/// Maps a transport failure onto the session error taxonomy
fn classify(error: &reqwest::Error, url: &str) -> SessionError {
    if error.is_timeout() {
        return SessionError::Timeout {
            operation: format!("request {url}"),
            after: Duration::ZERO,
        };
    }
    if let Some(status) = error.status() {
        return status_error(status, url);
    }
    SessionError::Network(format!("{url}: {error}"))
}

/// 401/403 mean the storefront dropped our session
pub(crate) fn status_error(status: StatusCode, url: &str) -> SessionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SessionError::SessionLost(format!("HTTP {} from {}", status.as_u16(), url))
        }
        _ => SessionError::Http {
            status: status.as_u16(),
            message: format!("{} from {}", status.canonical_reason().unwrap_or("request failed"), url),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::retry_manager::RetryableError;

    #[test]
    fn auth_failures_are_session_loss() {
        assert!(status_error(StatusCode::FORBIDDEN, "https://shop.test/").is_session_lost());
        assert!(status_error(StatusCode::UNAUTHORIZED, "https://shop.test/").is_session_lost());
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_are_not() {
        assert!(status_error(StatusCode::BAD_GATEWAY, "https://shop.test/").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "https://shop.test/").is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "https://shop.test/").is_transient());
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = HttpClientConfig {
            max_requests_per_second: 0,
            ..HttpClientConfig::default()
        };
        assert!(config.rate_limiter().is_err());
    }

    #[test]
    fn builds_client_from_storefront_config() {
        let config = HttpClientConfig::default();
        let limiter = config.rate_limiter().unwrap();
        let client = HttpClient::new(config, limiter).unwrap();
        assert_eq!(client.config().max_requests_per_second, 7);
    }
}
