//! Credential providers for authenticated scraping.
//!
//! [`StaticCredentials`] attaches fixed headers and never refreshes.
//! [`RefreshingCredentials`] holds a bearer token and swaps it through a
//! [`TokenSource`] when the target rejects a request with 401 or 403.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use forager_core::traits::CredentialProvider;

/// Fixed headers, typically an API key or a long-lived bearer token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    headers: Vec<(String, String)>,
}

impl StaticCredentials {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            headers: vec![("authorization".to_string(), format!("Bearer {}", token.into()))],
        }
    }
}

impl CredentialProvider for StaticCredentials {
    async fn headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    async fn on_auth_failure(&self, _status: u16) -> bool {
        false
    }
}

/// Produces replacement tokens after an authentication failure.
pub trait TokenSource: Send + Sync + Clone {
    /// Return a fresh token, or `None` when refreshing is not possible.
    fn refresh(&self) -> impl Future<Output = Option<String>> + Send;
}

/// Bearer-token credentials that refresh through a [`TokenSource`].
#[derive(Debug, Clone)]
pub struct RefreshingCredentials<S: TokenSource> {
    token: Arc<Mutex<String>>,
    source: S,
}

impl<S: TokenSource> RefreshingCredentials<S> {
    pub fn new(initial_token: impl Into<String>, source: S) -> Self {
        Self {
            token: Arc::new(Mutex::new(initial_token.into())),
            source,
        }
    }

    fn lock_token(&self) -> MutexGuard<'_, String> {
        match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Credential token lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<S: TokenSource> CredentialProvider for RefreshingCredentials<S> {
    async fn headers(&self) -> Vec<(String, String)> {
        let token = self.lock_token().clone();
        vec![("authorization".to_string(), format!("Bearer {token}"))]
    }

    async fn on_auth_failure(&self, status: u16) -> bool {
        tracing::info!(%status, "Authentication rejected, requesting a fresh token");
        match self.source.refresh().await {
            Some(fresh) => {
                *self.lock_token() = fresh;
                true
            }
            None => false,
        }
    }
}
