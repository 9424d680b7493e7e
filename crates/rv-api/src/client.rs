//! Resilient API client
//!
//! [`ResilientApiClient::call`] attaches the shared bearer token, refreshes it
//! once on 401, and retries retryable failures under a [`RetryPolicy`].

use crate::error::{ApiError, ApiErrorKind};
use crate::retry::{RetryPolicy, RetryStep};
use crate::token::{Authenticator, TokenManager, DEFAULT_SAFETY_MARGIN};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for one control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://backup.example:9419/`
    pub base_url: String,
    /// Login name
    pub username: String,
    /// Environment variable holding the password
    pub password_env: String,
    /// Attempt budget per call (clamped to 3..=6)
    pub max_attempts: u32,
    /// Backoff unit in milliseconds
    pub backoff_base_ms: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Renew tokens this many seconds before expiry
    pub token_margin_secs: u64,
    /// Skip TLS certificate validation
    pub accept_invalid_certs: bool,
}

impl ApiConfig {
    /// Create config for a base URL with defaults elsewhere
    #[inline]
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Retry policy described by this config
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.backoff_base_ms))
    }

    /// Request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Token renewal margin
    #[inline]
    #[must_use]
    pub fn token_margin(&self) -> Duration {
        Duration::from_secs(self.token_margin_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password_env: "RVX_PASSWORD".to_string(),
            max_attempts: 4,
            backoff_base_ms: 1000,
            request_timeout_secs: 60,
            token_margin_secs: DEFAULT_SAFETY_MARGIN.as_secs(),
            accept_invalid_certs: false,
        }
    }
}

/// Authenticated, retrying client for one control plane
#[derive(Clone)]
pub struct ResilientApiClient {
    transport: Arc<dyn Transport>,
    tokens: Option<Arc<TokenManager>>,
    policy: RetryPolicy,
}

impl ResilientApiClient {
    /// Create a client over an arbitrary transport
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Option<Arc<TokenManager>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            tokens,
            policy,
        }
    }

    /// Create an HTTP client from config
    ///
    /// # Errors
    /// `ApiErrorKind::Client` when the base URL is invalid
    pub fn from_config(
        config: &ApiConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(
            &config.base_url,
            config.request_timeout(),
            config.accept_invalid_certs,
        )?;
        let tokens = TokenManager::with_margin(authenticator, config.token_margin());
        Ok(Self::new(
            Arc::new(transport),
            Some(Arc::new(tokens)),
            config.retry_policy(),
        ))
    }

    /// Retry policy in effect
    #[inline]
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute a call with token handling and retries
    ///
    /// # Errors
    /// The terminal [`ApiError`]: fatal on first sight, `Exhausted` after the
    /// attempt budget, `Unauthorized` when a renewed token is also rejected
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        let request = ApiRequest {
            method,
            endpoint: endpoint.to_string(),
            body,
        };

        let mut attempt = 0u32;
        let mut renewed_after_401 = false;

        loop {
            attempt += 1;
            let bearer = match &self.tokens {
                Some(tokens) => Some(tokens.bearer().await?),
                None => None,
            };

            let error = match self.transport.send(&request, bearer.as_deref()).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => response.into_error(endpoint),
                Err(e) => e,
            };

            if error.kind == ApiErrorKind::Unauthorized {
                match (&self.tokens, bearer, renewed_after_401) {
                    (Some(tokens), Some(stale), false) => {
                        tracing::debug!("{} returned 401, renewing token", endpoint);
                        tokens.invalidate(&stale).await?;
                        renewed_after_401 = true;
                        // The renewal cycle does not consume the retry budget.
                        attempt -= 1;
                        continue;
                    }
                    _ => return Err(error.with_attempts(attempt)),
                }
            }

            match self.policy.next_step(attempt, error) {
                RetryStep::Backoff { delay, error } => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        endpoint,
                        attempt,
                        self.policy.max_attempts,
                        error.message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryStep::Fail(error) => return Err(error),
            }
        }
    }

    /// GET and decode
    ///
    /// # Errors
    /// See [`Self::call`]; `Decode` when the body does not match `T`
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.call(Method::Get, endpoint, None).await?.json(endpoint)
    }

    /// POST and decode
    ///
    /// # Errors
    /// See [`Self::call`]; `Decode` when the body does not match `T`
    pub async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: Value,
    ) -> Result<T, ApiError> {
        self.call(Method::Post, endpoint, Some(body)).await?.json(endpoint)
    }

    /// Call and discard the body
    ///
    /// # Errors
    /// See [`Self::call`]
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<(), ApiError> {
        self.call(method, endpoint, body).await.map(|_| ())
    }
}

impl std::fmt::Debug for ResilientApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientApiClient")
            .field("policy", &self.policy)
            .field("authenticated", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}
