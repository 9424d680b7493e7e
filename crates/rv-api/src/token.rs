//! Bearer token lifecycle
//!
//! One token per control plane is shared by every concurrent worker. Reads
//! are lock-free in practice (`parking_lot::RwLock`), renewal is serialized by
//! an async mutex and double-checked so a burst of expiring callers produces a
//! single refresh. A caller still holding a stale token gets one 401 and one
//! renewal, which the client bounds to a single extra attempt.

use crate::error::ApiError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default renewal margin before expiry
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Access token with optional refresh token
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// Bearer value
    pub access: String,
    /// Refresh grant, when the server issued one
    pub refresh: Option<String>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Create a token expiring `ttl` from now
    #[must_use]
    pub fn new(access: impl Into<String>, refresh: Option<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            access: access.into(),
            refresh,
            expires_at: Utc::now() + ttl,
        }
    }

    /// Check whether the token expires within `margin` of `now`
    #[must_use]
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        self.expires_at - margin <= now
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Obtains and refreshes tokens for one control plane
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Full authentication with credentials
    async fn authenticate(&self) -> Result<Token, ApiError>;

    /// Exchange a refresh token for a new token
    async fn refresh(&self, refresh_token: &str) -> Result<Token, ApiError>;
}

/// Shared token holder
pub struct TokenManager {
    authenticator: Arc<dyn Authenticator>,
    current: RwLock<Option<Token>>,
    renewal: Mutex<()>,
    margin: Duration,
}

impl TokenManager {
    /// Create a manager with the default five minute margin
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self::with_margin(authenticator, DEFAULT_SAFETY_MARGIN)
    }

    /// Create a manager with a custom renewal margin
    #[must_use]
    pub fn with_margin(authenticator: Arc<dyn Authenticator>, margin: Duration) -> Self {
        Self {
            authenticator,
            current: RwLock::new(None),
            renewal: Mutex::new(()),
            margin,
        }
    }

    /// Current bearer, renewed first when missing or inside the margin
    ///
    /// # Errors
    /// `ApiErrorKind::Auth` when both refresh and re-authentication fail
    pub async fn bearer(&self) -> Result<String, ApiError> {
        if let Some(token) = self.fresh() {
            return Ok(token.access);
        }
        let stale = self.current.read().as_ref().map(|t| t.access.clone());
        self.renew(stale.as_deref()).await
    }

    /// Force renewal after the server rejected `stale`
    ///
    /// If another caller already replaced `stale`, the replacement is
    /// returned without contacting the server.
    ///
    /// # Errors
    /// `ApiErrorKind::Auth` when both refresh and re-authentication fail
    pub async fn invalidate(&self, stale: &str) -> Result<String, ApiError> {
        self.renew(Some(stale)).await
    }

    /// Snapshot of the held token
    #[must_use]
    pub fn snapshot(&self) -> Option<Token> {
        self.current.read().clone()
    }

    fn fresh(&self) -> Option<Token> {
        self.current
            .read()
            .as_ref()
            .filter(|t| !t.expires_within(self.margin, Utc::now()))
            .cloned()
    }

    async fn renew(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let _guard = self.renewal.lock().await;

        // Someone else renewed while we waited.
        if let Some(token) = self.fresh() {
            if stale != Some(token.access.as_str()) {
                return Ok(token.access);
            }
        }

        let refresh_grant = self.current.read().as_ref().and_then(|t| t.refresh.clone());
        let token = match refresh_grant {
            Some(grant) => match self.authenticator.refresh(&grant).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!("token refresh failed, re-authenticating: {}", e);
                    self.authenticator.authenticate().await?
                }
            },
            None => self.authenticator.authenticate().await?,
        };

        tracing::debug!("token renewed, expires at {}", token.expires_at);
        let access = token.access.clone();
        *self.current.write() = Some(token);
        Ok(access)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("current", &*self.current.read())
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingAuth {
        logins: AtomicU32,
        refreshes: AtomicU32,
        refresh_fails: bool,
        ttl_secs: u64,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn authenticate(&self) -> Result<Token, ApiError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token::new(
                format!("login-{n}"),
                Some(format!("grant-{n}")),
                Duration::from_secs(self.ttl_secs),
            ))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Token, ApiError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.refresh_fails {
                return Err(ApiError::auth("/token", "refresh grant revoked"));
            }
            Ok(Token::new(
                format!("refreshed-{n}"),
                Some(format!("grant-r{n}")),
                Duration::from_secs(self.ttl_secs),
            ))
        }
    }

    fn auth(ttl_secs: u64, refresh_fails: bool) -> Arc<CountingAuth> {
        Arc::new(CountingAuth {
            ttl_secs,
            refresh_fails,
            ..CountingAuth::default()
        })
    }

    #[tokio::test]
    async fn first_call_authenticates_then_reuses() {
        let a = auth(3600, false);
        let mgr = TokenManager::new(a.clone());
        assert_eq!(mgr.bearer().await.unwrap(), "login-1");
        assert_eq!(mgr.bearer().await.unwrap(), "login-1");
        assert_eq!(a.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_proactively() {
        // 4 minutes of life left is inside the 5 minute margin.
        let a = auth(240, false);
        let mgr = TokenManager::new(a.clone());
        assert_eq!(mgr.bearer().await.unwrap(), "login-1");
        assert_eq!(mgr.bearer().await.unwrap(), "refreshed-1");
        assert_eq!(a.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_login() {
        let a = auth(60, true);
        let mgr = TokenManager::new(a.clone());
        mgr.bearer().await.unwrap();
        assert_eq!(mgr.bearer().await.unwrap(), "login-2");
        assert_eq!(a.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(a.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_invalidations_renew_once() {
        let a = auth(3600, false);
        let mgr = Arc::new(TokenManager::new(a.clone()));
        let stale = mgr.bearer().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let stale = stale.clone();
            handles.push(tokio::spawn(async move { mgr.invalidate(&stale).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "refreshed-1");
        }
        assert_eq!(a.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_redacts_secrets() {
        let t = Token::new("secret-access", Some("secret-refresh".into()), Duration::from_secs(5));
        let shown = format!("{t:?}");
        assert!(!shown.contains("secret"));
    }
}
