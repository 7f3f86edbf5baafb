//! reqwest-backed [`HttpTransport`].
//!
//! One shared client handles direct connections; proxied requests get a
//! client per proxy address, built lazily and cached, because reqwest
//! fixes the proxy at client construction. User agents rotate per request
//! unless the caller supplies their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use forager_core::traits::{HttpTransport, TransportRequest, TransportResponse};
use forager_core::ScrapeError;

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) \
     Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
];

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP transport over a pool of reqwest clients.
#[derive(Clone)]
pub struct ReqwestTransport {
    default_client: reqwest::Client,
    proxy_clients: Arc<Mutex<HashMap<String, reqwest::Client>>>,
    user_agents: Arc<Vec<String>>,
    ua_cursor: Arc<AtomicUsize>,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ScrapeError> {
        let user_agents = DEFAULT_USER_AGENTS
            .iter()
            .map(|ua| ua.to_string())
            .collect();
        Ok(Self {
            default_client: build_client(None, DEFAULT_CONNECT_TIMEOUT)?,
            proxy_clients: Arc::new(Mutex::new(HashMap::new())),
            user_agents: Arc::new(user_agents),
            ua_cursor: Arc::new(AtomicUsize::new(0)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Replace the rotated user agents. An empty list disables the
    /// transport's own user-agent header entirely.
    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = Arc::new(user_agents);
        self.ua_cursor.store(0, Ordering::Relaxed);
        self
    }

    /// Rebuild with a different connect timeout. Cached proxy clients are
    /// dropped so they pick up the new timeout on next use.
    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Result<Self, ScrapeError> {
        Ok(Self {
            default_client: build_client(None, connect_timeout)?,
            proxy_clients: Arc::new(Mutex::new(HashMap::new())),
            user_agents: self.user_agents,
            ua_cursor: self.ua_cursor,
            connect_timeout,
        })
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, reqwest::Client>> {
        match self.proxy_clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Proxy client cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn next_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let idx = self.ua_cursor.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(&self.user_agents[idx])
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, ScrapeError> {
        let Some(address) = proxy else {
            return Ok(self.default_client.clone());
        };
        let mut clients = self.lock_clients();
        if let Some(client) = clients.get(address) {
            return Ok(client.clone());
        }
        let client = build_client(Some(address), self.connect_timeout)?;
        clients.insert(address.to_string(), client.clone());
        Ok(client)
    }
}

fn build_client(
    proxy: Option<&str>,
    connect_timeout: Duration,
) -> Result<reqwest::Client, ScrapeError> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
    if let Some(address) = proxy {
        let proxy = reqwest::Proxy::all(address)
            .map_err(|e| ScrapeError::Network(format!("invalid proxy '{address}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| ScrapeError::Network(format!("failed to build HTTP client: {e}")))
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> ScrapeError {
    if e.is_timeout() {
        ScrapeError::Timeout(timeout)
    } else if e.is_connect() {
        ScrapeError::Network(format!("connection failed: {e}"))
    } else {
        ScrapeError::Network(e.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &TransportRequest,
    ) -> Result<TransportResponse, ScrapeError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ScrapeError::Network(format!("invalid method '{}': {e}", request.method)))?;
        let client = self.client_for(request.proxy.as_deref())?;

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout);
        let caller_sets_ua = request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("user-agent"));
        if !caller_sets_ua
            && let Some(ua) = self.next_user_agent()
        {
            builder = builder.header("user-agent", ua);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?
            .to_vec();

        Ok(TransportResponse {
            status,
            final_url,
            headers,
            body,
        })
    }
}
