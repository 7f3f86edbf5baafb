//! Seams between the pipeline and the outside world.
//!
//! The fetch path talks HTTP through [`HttpTransport`], NLP rules go
//! through [`TextAnalyzer`], and authenticated scrapes plug in a
//! [`CredentialProvider`]. Each has a do-nothing implementation so the
//! core works standalone and tests can substitute recording mocks.

use std::future::Future;
use std::time::Duration;

use crate::content::FetchResult;
use crate::error::ScrapeError;
use crate::fetch::FetchOptions;
use crate::rules::NlpTask;

/// One outgoing HTTP request, fully resolved.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: String,
    /// Header name/value pairs, applied in order.
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    /// Proxy address to route through, if any.
    pub proxy: Option<String>,
}

/// What came back from the wire, before classification.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// Response headers with lowercased names.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// First header with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Executes HTTP requests. Implementations handle the socket-level
/// concerns (TLS, proxies, redirects) and nothing else; retries, caching
/// and pacing live above this seam.
pub trait HttpTransport: Send + Sync + Clone {
    fn execute(
        &self,
        request: &TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, ScrapeError>> + Send;
}

/// High-level fetch: cache, pacing, proxies and retries included.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> impl Future<Output = Result<FetchResult, ScrapeError>> + Send;
}

/// Runs NLP tasks for `nlp` rules. Errors are plain strings because they
/// degrade a single field rather than failing extraction.
pub trait TextAnalyzer: Send + Sync + Clone {
    fn analyze(
        &self,
        text: &str,
        task: NlpTask,
        entity_type: Option<&str>,
    ) -> impl Future<Output = Result<serde_json::Value, String>> + Send;
}

/// Analyzer used when none is configured: every NLP rule degrades to a
/// field failure that names the missing piece.
#[derive(Debug, Clone, Default)]
pub struct NullAnalyzer;

impl TextAnalyzer for NullAnalyzer {
    async fn analyze(
        &self,
        _text: &str,
        task: NlpTask,
        _entity_type: Option<&str>,
    ) -> Result<serde_json::Value, String> {
        Err(format!("no text analyzer configured (task: {task})"))
    }
}

/// Supplies auth headers and reacts to auth rejections.
///
/// When a fetch comes back 401 or 403, `on_auth_failure` may refresh the
/// underlying credentials; returning `true` grants the fetch one extra
/// attempt with fresh headers.
pub trait CredentialProvider: Send + Sync + Clone {
    fn headers(&self) -> impl Future<Output = Vec<(String, String)>> + Send;

    fn on_auth_failure(&self, status: u16) -> impl Future<Output = bool> + Send;
}

/// Provider for unauthenticated scraping: no headers, no refresh.
#[derive(Debug, Clone, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    async fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn on_auth_failure(&self, _status: u16) -> bool {
        false
    }
}
