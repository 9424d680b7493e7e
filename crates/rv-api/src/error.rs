//! Error types for the API layer
//!
//! Every remote failure is reduced to an [`ApiError`] carrying a closed
//! [`ApiErrorKind`]. The kind alone decides whether a call may be retried:
//! - client errors other than 429 are fatal
//! - 429, 5xx, network failures and timeouts are retryable
//! - 401 triggers exactly one token refresh before it becomes fatal

use std::time::Duration;

/// Classification of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// 401 after the single refresh-and-retry cycle
    Unauthorized,
    /// 4xx other than 401 and 429
    Client,
    /// 429 Too Many Requests
    RateLimited,
    /// 5xx
    Server,
    /// Connection refused, reset, DNS failure
    Network,
    /// Request exceeded its timeout
    Timeout,
    /// Response body did not match the expected contract
    Decode,
    /// Authentication or token refresh failed
    Auth,
    /// Retry budget spent on retryable failures
    Exhausted,
}

impl ApiErrorKind {
    /// Classify an HTTP status code that is not a success
    #[inline]
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Client,
        }
    }
}

/// Remote call failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{endpoint}: {kind:?}{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct ApiError {
    /// Failure classification
    pub kind: ApiErrorKind,
    /// Endpoint that failed
    pub endpoint: String,
    /// HTTP status when one was received
    pub status: Option<u16>,
    /// Human readable detail
    pub message: String,
    /// Server supplied Retry-After hint
    pub retry_after: Option<Duration>,
    /// Attempts made before this error surfaced
    pub attempts: u32,
}

impl ApiError {
    /// Create a new error without status
    #[inline]
    #[must_use]
    pub fn new(kind: ApiErrorKind, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            status: None,
            message: message.into(),
            retry_after: None,
            attempts: 1,
        }
    }

    /// Create from a non-success HTTP status
    #[must_use]
    pub fn from_status(
        endpoint: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            kind: ApiErrorKind::from_status(status),
            endpoint: endpoint.into(),
            status: Some(status),
            message: message.into(),
            retry_after,
            attempts: 1,
        }
    }

    /// Response body did not decode
    #[inline]
    #[must_use]
    pub fn decode(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Decode, endpoint, message)
    }

    /// Authentication failure
    #[inline]
    #[must_use]
    pub fn auth(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Auth, endpoint, message)
    }

    /// Check if the failure may succeed on a later attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::RateLimited
                | ApiErrorKind::Server
                | ApiErrorKind::Network
                | ApiErrorKind::Timeout
        )
    }

    /// Check if the failure is a 401
    #[inline]
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.kind == ApiErrorKind::Unauthorized
    }

    /// Check if the resource does not exist
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// Wrap a retryable error once the attempt budget is spent
    #[must_use]
    pub fn exhausted(last: ApiError, attempts: u32) -> Self {
        Self {
            kind: ApiErrorKind::Exhausted,
            message: format!("gave up after {attempts} attempts: {}", last.message),
            attempts,
            ..last
        }
    }

    /// Record how many attempts were made
    #[inline]
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiErrorKind::from_status(401), ApiErrorKind::Unauthorized);
        assert_eq!(ApiErrorKind::from_status(404), ApiErrorKind::Client);
        assert_eq!(ApiErrorKind::from_status(429), ApiErrorKind::RateLimited);
        assert_eq!(ApiErrorKind::from_status(503), ApiErrorKind::Server);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ApiError::from_status("/x", 429, "slow down", None).is_retryable());
        assert!(ApiError::from_status("/x", 502, "bad gateway", None).is_retryable());
        assert!(ApiError::new(ApiErrorKind::Network, "/x", "reset").is_retryable());
        assert!(!ApiError::from_status("/x", 400, "bad request", None).is_retryable());
        assert!(!ApiError::from_status("/x", 401, "nope", None).is_retryable());
        assert!(!ApiError::decode("/x", "missing field").is_retryable());
    }

    #[test]
    fn exhausted_keeps_endpoint_and_status() {
        let last = ApiError::from_status("/api/jobs", 503, "unavailable", None);
        let err = ApiError::exhausted(last, 4);
        assert_eq!(err.kind, ApiErrorKind::Exhausted);
        assert_eq!(err.status, Some(503));
        assert_eq!(err.attempts, 4);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/api/jobs"));
    }
}
