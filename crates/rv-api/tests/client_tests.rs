//! Behavioural tests for the resilient client's retry and token machine.
//!
//! Time is paused, so backoff sleeps complete instantly while still being
//! measurable through `tokio::time::Instant`.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rv_api::{
    ApiError, ApiErrorKind, ApiRequest, ApiResponse, Authenticator, Method, ResilientApiClient,
    RetryPolicy, Token, TokenManager, Transport,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replays a script of replies and records the bearer of every request
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
    bearers: Mutex<Vec<Option<String>>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<ApiResponse, ApiError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            bearers: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.bearers.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        self.bearers.lock().push(bearer.map(str::to_string));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ApiResponse::new(200, json!({}))))
    }
}

#[derive(Default)]
struct SequenceAuth {
    logins: AtomicU32,
    refreshes: AtomicU32,
}

#[async_trait]
impl Authenticator for SequenceAuth {
    async fn authenticate(&self) -> Result<Token, ApiError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::new(format!("t{n}"), Some("grant".into()), Duration::from_secs(3600)))
    }

    async fn refresh(&self, _grant: &str) -> Result<Token, ApiError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Token::new(format!("r{n}"), Some("grant".into()), Duration::from_secs(3600)))
    }
}

fn ok() -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(200, json!({"ok": true})))
}

fn status(code: u16) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(code, json!({"message": format!("status {code}")})))
}

fn client(
    transport: Arc<ScriptedTransport>,
    auth: Option<Arc<SequenceAuth>>,
    attempts: u32,
) -> ResilientApiClient {
    let tokens = auth.map(|a| Arc::new(TokenManager::new(a)));
    ResilientApiClient::new(transport, tokens, RetryPolicy::new(attempts))
}

#[tokio::test(start_paused = true)]
async fn transient_server_error_is_retried() {
    let t = ScriptedTransport::new(vec![status(503), status(502), ok()]);
    let c = client(t.clone(), None, 4);

    let start = tokio::time::Instant::now();
    let resp = c.call(Method::Get, "api/v1/jobs", None).await.unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(t.calls(), 3);
    // 2s after attempt 1, 4s after attempt 2
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn client_error_is_fatal_without_retry() {
    let t = ScriptedTransport::new(vec![status(400), ok()]);
    let c = client(t.clone(), None, 5);

    let err = c.call(Method::Post, "api/v1/restore/full", None).await.unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Client);
    assert_eq!(err.status, Some(400));
    assert_eq!(t.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_returns_terminal_error() {
    let t = ScriptedTransport::new(vec![status(500), status(500), status(500), ok()]);
    let c = client(t.clone(), None, 3);

    let err = c.call(Method::Get, "api/v3/clusters", None).await.unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Exhausted);
    assert_eq!(err.attempts, 3);
    assert_eq!(t.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_widens_the_wait() {
    let throttled = Ok(ApiResponse::new(429, json!({})).with_retry_after(Duration::from_secs(20)));
    let t = ScriptedTransport::new(vec![throttled, ok()]);
    let c = client(t.clone(), None, 3);

    let start = tokio::time::Instant::now();
    c.call(Method::Get, "api/v1/jobs", None).await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn network_failures_are_retryable() {
    let reset = Err(ApiError::new(ApiErrorKind::Network, "api/v1/jobs", "connection reset"));
    let t = ScriptedTransport::new(vec![reset, ok()]);
    let c = client(t.clone(), None, 3);

    assert!(c.call(Method::Get, "api/v1/jobs", None).await.is_ok());
    assert_eq!(t.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_refreshes_once_and_replays() {
    let t = ScriptedTransport::new(vec![status(401), ok()]);
    let auth = Arc::new(SequenceAuth::default());
    let c = client(t.clone(), Some(auth.clone()), 3);

    c.call(Method::Get, "api/v1/jobs", None).await.unwrap();

    assert_eq!(
        *t.bearers.lock(),
        vec![Some("t1".to_string()), Some("r1".to_string())]
    );
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn second_unauthorized_is_fatal() {
    let t = ScriptedTransport::new(vec![status(401), status(401), ok()]);
    let auth = Arc::new(SequenceAuth::default());
    let c = client(t.clone(), Some(auth.clone()), 5);

    let err = c.call(Method::Get, "api/v1/jobs", None).await.unwrap_err();

    assert_eq!(err.kind, ApiErrorKind::Unauthorized);
    assert_eq!(t.calls(), 2);
    assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_cycle_does_not_consume_retry_budget() {
    let t = ScriptedTransport::new(vec![status(401), status(503), status(503), ok()]);
    let auth = Arc::new(SequenceAuth::default());
    let c = client(t.clone(), Some(auth), 3);

    assert!(c.call(Method::Get, "api/v1/jobs", None).await.is_ok());
    assert_eq!(t.calls(), 4);
}
