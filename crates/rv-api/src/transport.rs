//! Request transport
//!
//! The [`Transport`] trait is the only place bytes leave the process. The
//! resilient client layers token handling and retries on top of it, so the
//! whole retry machine can be exercised against an in-memory transport.

use crate::error::{ApiError, ApiErrorKind};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// HTTP method subset used by the control planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Method
    pub method: Method,
    /// Path relative to the transport's base URL
    pub endpoint: String,
    /// Optional JSON body
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Create a request without body
    #[inline]
    #[must_use]
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
        }
    }

    /// With JSON body
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Inbound response, success or not
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status
    pub status: u16,
    /// Parsed JSON body, `Null` when empty
    pub body: Value,
    /// Retry-After header in seconds
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    /// Create a response
    #[inline]
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    /// With Retry-After hint
    #[inline]
    #[must_use]
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// 2xx
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body into a typed contract
    ///
    /// # Errors
    /// `ApiErrorKind::Decode` when the body does not match `T`
    pub fn json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| ApiError::decode(endpoint, e.to_string()))
    }

    /// Convert a non-success response into an error
    #[must_use]
    pub fn into_error(self, endpoint: &str) -> ApiError {
        let message = self
            .body
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| self.body.to_string(), str::to_string);
        ApiError::from_status(endpoint, self.status, message, self.retry_after)
    }
}

/// Sends one request, no retries, no token logic
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request with an optional bearer token
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>)
        -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpTransport {
    /// Create a transport rooted at `base_url`
    ///
    /// # Errors
    /// `ApiErrorKind::Client` if the URL does not parse or the client cannot
    /// be built
    pub fn new(
        base_url: &str,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, ApiError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ApiError::new(ApiErrorKind::Client, base_url, e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| ApiError::new(ApiErrorKind::Client, base_url.as_str(), e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn url(&self, endpoint: &str) -> Result<reqwest::Url, ApiError> {
        self.base_url
            .join(endpoint)
            .map_err(|e| ApiError::new(ApiErrorKind::Client, endpoint, e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.endpoint)?;
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                ApiErrorKind::Timeout
            } else {
                ApiErrorKind::Network
            };
            ApiError::new(kind, &request.endpoint, e.to_string())
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::new(ApiErrorKind::Network, &request.endpoint, e.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(ApiResponse {
            status,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_success_uses_message_field() {
        let err = ApiResponse::new(409, json!({"message": "already mounted"})).into_error("/mount");
        assert_eq!(err.status, Some(409));
        assert_eq!(err.message, "already mounted");
    }

    #[test]
    fn decode_failure_is_typed() {
        #[derive(Debug, serde::Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            id: String,
        }
        let resp = ApiResponse::new(200, json!({"other": 1}));
        let err = resp.json::<Needs>("/x").unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Decode);
    }

    #[test]
    fn transport_rejects_bad_base_url() {
        assert!(HttpTransport::new("not a url", Duration::from_secs(5), false).is_err());
    }
}
