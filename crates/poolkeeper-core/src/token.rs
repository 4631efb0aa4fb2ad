//! Managed-authentication tokens used in place of static passwords.
//!
//! Cloud-managed databases (IAM auth, managed identities) hand out
//! short-lived tokens. A [`TokenProvider`] caches the current token and only
//! asks its [`TokenSource`] for a new one when the cached token is within
//! `skew` of expiring.

use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{PoolError, PoolResult};

/// Default refresh margin before a token's expiry.
pub const DEFAULT_TOKEN_SKEW: Duration = Duration::from_secs(60);

/// A token and its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: SystemTime,
}

impl Token {
    /// A token valid for `ttl` from now.
    pub fn with_ttl(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: SystemTime::now() + ttl,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Fetches fresh tokens from an identity service.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> PoolResult<Token>;
}

/// Thread-safe caching wrapper around a [`TokenSource`].
pub struct TokenProvider {
    source: Box<dyn TokenSource>,
    skew: Duration,
    cached: Mutex<Option<Token>>,
}

impl TokenProvider {
    pub fn new(source: Box<dyn TokenSource>) -> Self {
        Self::with_skew(source, DEFAULT_TOKEN_SKEW)
    }

    pub fn with_skew(source: Box<dyn TokenSource>, skew: Duration) -> Self {
        Self {
            source,
            skew,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached token, refreshing it first if it is about to expire.
    ///
    /// The cache lock is held across the fetch so concurrent callers
    /// trigger at most one refresh.
    pub async fn get_token(&self) -> PoolResult<String> {
        let mut cached = self.cached.lock().await;

        let now = SystemTime::now();
        let fresh = cached
            .as_ref()
            .is_some_and(|token| now + self.skew < token.expires_at);
        if !fresh {
            let token = self.source.fetch_token().await?;
            tracing::debug!(expires_at = ?token.expires_at, "refreshed authentication token");
            *cached = Some(token);
        }

        cached
            .as_ref()
            .map(|token| token.value.clone())
            .ok_or_else(|| PoolError::Token("no token available".to_string()))
    }
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}
