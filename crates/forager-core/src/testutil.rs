//! Test doubles shared by unit and integration tests.
//!
//! The mocks record what they were asked and pop scripted responses off a
//! queue, so tests can assert on both traffic and behavior without any
//! real network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;

use crate::content::{ContentKind, FetchResult};
use crate::error::ScrapeError;
use crate::fetch::FetchOptions;
use crate::rules::NlpTask;
use crate::traits::{
    CredentialProvider, Fetcher, HttpTransport, TextAnalyzer, TransportRequest, TransportResponse,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A 200 response with an HTML body.
pub fn html_response(body: &str) -> TransportResponse {
    TransportResponse {
        status: 200,
        final_url: String::new(),
        headers: vec![(
            "content-type".to_string(),
            "text/html; charset=utf-8".to_string(),
        )],
        body: body.as_bytes().to_vec(),
    }
}

/// A 200 response with a JSON body.
pub fn json_response(body: &str) -> TransportResponse {
    TransportResponse {
        status: 200,
        final_url: String::new(),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: body.as_bytes().to_vec(),
    }
}

/// An empty-bodied response with the given status.
pub fn status_response(status: u16) -> TransportResponse {
    TransportResponse {
        status,
        final_url: String::new(),
        headers: vec![("content-type".to_string(), "text/html".to_string())],
        body: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Transport that replays a scripted queue of responses and records every
/// request. Once the queue is empty it answers 200 with an empty body.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    responses: Arc<Mutex<VecDeque<Result<TransportResponse, ScrapeError>>>>,
    requests: Arc<Mutex<Vec<TransportRequest>>>,
}

impl MockTransport {
    pub fn with_responses(responses: Vec<Result<TransportResponse, ScrapeError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_statuses(statuses: &[u16]) -> Self {
        Self::with_responses(statuses.iter().map(|&s| Ok(status_response(s))).collect())
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        lock(&self.requests).clone()
    }
}

impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, ScrapeError> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.responses).pop_front();
        let mut response = match next {
            Some(scripted) => scripted?,
            None => status_response(200),
        };
        if response.final_url.is_empty() {
            response.final_url = request.url.clone();
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// MockSite
// ---------------------------------------------------------------------------

/// A [`Fetcher`] serving a fixed set of HTML pages by URL. Unknown URLs
/// answer 404. Fetch order is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockSite {
    pages: Arc<Mutex<HashMap<String, String>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&self, url: &str, html: &str) {
        lock(&self.pages).insert(url.to_string(), html.to_string());
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        lock(&self.fetched).clone()
    }
}

impl Fetcher for MockSite {
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResult, ScrapeError> {
        lock(&self.fetched).push(url.to_string());
        let body = lock(&self.pages).get(url).cloned();
        match body {
            Some(body) => Ok(FetchResult {
                url: url.to_string(),
                final_url: url.to_string(),
                status_code: 200,
                content: body.into_bytes(),
                content_type: ContentKind::Html,
                fetched_at: Utc::now(),
                from_cache: false,
            }),
            None => Err(ScrapeError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockAnalyzer
// ---------------------------------------------------------------------------

/// A [`TextAnalyzer`] that replays scripted results and records what it
/// was asked to analyze.
#[derive(Debug, Clone, Default)]
pub struct MockAnalyzer {
    responses: Arc<Mutex<VecDeque<Result<Value, String>>>>,
    calls: Arc<Mutex<Vec<(String, NlpTask, Option<String>)>>>,
}

impl MockAnalyzer {
    pub fn with_responses(responses: Vec<Result<Value, String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(String, NlpTask, Option<String>)> {
        lock(&self.calls).clone()
    }
}

impl TextAnalyzer for MockAnalyzer {
    async fn analyze(
        &self,
        text: &str,
        task: NlpTask,
        entity_type: Option<&str>,
    ) -> Result<Value, String> {
        lock(&self.calls).push((text.to_string(), task, entity_type.map(str::to_string)));
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err("no scripted analyzer response".to_string()))
    }
}

// ---------------------------------------------------------------------------
// RefreshOnceCredentials
// ---------------------------------------------------------------------------

/// Credentials that honor exactly one refresh: the first auth failure
/// swaps in a new token and returns `true`, every later one returns
/// `false`.
#[derive(Debug, Clone)]
pub struct RefreshOnceCredentials {
    token: Arc<Mutex<String>>,
    refreshed: Arc<Mutex<bool>>,
}

impl RefreshOnceCredentials {
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::new(Mutex::new(token.to_string())),
            refreshed: Arc::new(Mutex::new(false)),
        }
    }

    pub fn was_refreshed(&self) -> bool {
        *lock(&self.refreshed)
    }
}

impl CredentialProvider for RefreshOnceCredentials {
    async fn headers(&self) -> Vec<(String, String)> {
        let token = lock(&self.token).clone();
        vec![("authorization".to_string(), format!("Bearer {token}"))]
    }

    async fn on_auth_failure(&self, _status: u16) -> bool {
        let mut refreshed = lock(&self.refreshed);
        if *refreshed {
            return false;
        }
        *refreshed = true;
        let mut token = lock(&self.token);
        let current = token.clone();
        *token = format!("{current}-refreshed");
        true
    }
}
