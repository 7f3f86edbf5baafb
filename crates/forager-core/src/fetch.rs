//! The resilient fetch path.
//!
//! A fetch goes: cache lookup, rate-limit admission, proxy acquisition,
//! transport execution, outcome classification. Transient failures (429,
//! 5xx, network errors, timeouts) retry inside a bounded attempt budget
//! with exponential backoff, usually through a different proxy. An auth
//! rejection may refresh credentials and gets one extra attempt outside
//! the budget. Other 4xx fail immediately. Cancellation is honored at
//! every wait point.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffConfig;
use crate::cache::{cache_key, NullCache, ResponseCache};
use crate::content::{ContentKind, FetchResult};
use crate::error::ScrapeError;
use crate::proxy::{ProxyLease, ProxyManager};
use crate::ratelimit::{domain_key, RateLimiter};
use crate::traits::{CredentialProvider, Fetcher, HttpTransport, NoCredentials, TransportRequest};

/// Client-wide fetch defaults.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Total attempts per fetch, counting the first one.
    pub max_attempts: u32,
    /// Per-request timeout unless overridden per fetch.
    pub timeout: Duration,
    /// Backoff between transient-failure retries.
    pub backoff: BackoffConfig,
    /// TTL for cached responses unless overridden per fetch.
    pub cache_ttl: Duration,
    /// Extra rounds to wait for a proxy when the pool has no healthy one.
    pub proxy_acquire_retries: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            cache_ttl: Duration::from_secs(3600),
            proxy_acquire_retries: 2,
        }
    }
}

impl FetchConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_proxy_acquire_retries(mut self, retries: u32) -> Self {
        self.proxy_acquire_retries = retries;
        self
    }
}

/// Per-call overrides layered on [`FetchConfig`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Option<Duration>,
    pub cache_ttl: Option<Duration>,
    pub use_cache: bool,
    /// Wait for a rate-limit slot (default) instead of failing fast with
    /// [`ScrapeError::RateLimited`].
    pub wait_for_rate_limit: bool,
    /// Extra request headers, applied after credential headers.
    pub headers: Vec<(String, String)>,
    pub cancel: CancellationToken,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cache_ttl: None,
            use_cache: true,
            wait_for_rate_limit: true,
            headers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl FetchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn wait_for_rate_limit(mut self, wait: bool) -> Self {
        self.wait_for_rate_limit = wait;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum Outcome {
    Success(FetchResult),
    Transient(ScrapeError),
    AuthRejected(u16),
    Fatal(ScrapeError),
    Cancelled,
}

/// Fetches URLs through the full resilience stack: cache, per-domain rate
/// limiting, proxy rotation, bounded retry and credential refresh.
#[derive(Clone)]
pub struct FetchClient<T, C = NullCache, P = NoCredentials>
where
    T: HttpTransport,
    C: ResponseCache,
    P: CredentialProvider,
{
    transport: T,
    cache: C,
    credentials: P,
    proxies: ProxyManager,
    limiter: RateLimiter,
    config: FetchConfig,
}

impl<T: HttpTransport> FetchClient<T, NullCache, NoCredentials> {
    /// Client with no cache, no proxies and no credentials; defaults are
    /// swapped in with the `with_*` builders.
    pub fn new(transport: T, config: FetchConfig) -> Self {
        Self {
            transport,
            cache: NullCache,
            credentials: NoCredentials,
            proxies: ProxyManager::direct(),
            limiter: RateLimiter::default(),
            config,
        }
    }
}

impl<T, C, P> FetchClient<T, C, P>
where
    T: HttpTransport,
    C: ResponseCache,
    P: CredentialProvider,
{
    pub fn with_cache<C2: ResponseCache>(self, cache: C2) -> FetchClient<T, C2, P> {
        FetchClient {
            transport: self.transport,
            cache,
            credentials: self.credentials,
            proxies: self.proxies,
            limiter: self.limiter,
            config: self.config,
        }
    }

    pub fn with_credentials<P2: CredentialProvider>(
        self,
        credentials: P2,
    ) -> FetchClient<T, C, P2> {
        FetchClient {
            transport: self.transport,
            cache: self.cache,
            credentials,
            proxies: self.proxies,
            limiter: self.limiter,
            config: self.config,
        }
    }

    pub fn with_proxies(mut self, proxies: ProxyManager) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Bounded wait for a proxy slot. [`ScrapeError::NoHealthyProxy`] is
    /// retryable because cooldowns expire, so a few backed-off rounds are
    /// worth it before giving up.
    async fn acquire_proxy(&self, cancel: &CancellationToken) -> Result<ProxyLease, ScrapeError> {
        let mut tries: u32 = 0;
        loop {
            match self.proxies.acquire() {
                Ok(lease) => return Ok(lease),
                Err(e) => {
                    if tries >= self.config.proxy_acquire_retries {
                        return Err(e);
                    }
                    let delay = self.config.backoff.delay_for_attempt(tries);
                    tracing::debug!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "No proxy available, waiting"
                    );
                    tries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        url: &str,
        options: &FetchOptions,
        lease: &ProxyLease,
    ) -> Outcome {
        let mut headers = self.credentials.headers().await;
        headers.extend(options.headers.iter().cloned());
        let request = TransportRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            headers,
            timeout: options.timeout.unwrap_or(self.config.timeout),
            proxy: lease.address().map(str::to_string),
        };

        let response = tokio::select! {
            _ = options.cancel.cancelled() => return Outcome::Cancelled,
            response = self.transport.execute(&request) => response,
        };

        match response {
            Err(e) if e.is_retryable() => Outcome::Transient(e),
            Err(e) => Outcome::Fatal(e),
            Ok(response) => {
                let status = response.status;
                if (200..300).contains(&status) {
                    let content_type =
                        ContentKind::detect(response.header("content-type"), &response.body);
                    Outcome::Success(FetchResult {
                        url: url.to_string(),
                        final_url: response.final_url,
                        status_code: status,
                        content: response.body,
                        content_type,
                        fetched_at: Utc::now(),
                        from_cache: false,
                    })
                } else if status == 429 || status >= 500 {
                    Outcome::Transient(ScrapeError::HttpStatus {
                        status,
                        url: url.to_string(),
                    })
                } else if status == 401 || status == 403 {
                    Outcome::AuthRejected(status)
                } else {
                    Outcome::Fatal(ScrapeError::HttpStatus {
                        status,
                        url: url.to_string(),
                    })
                }
            }
        }
    }
}

impl<T, C, P> Fetcher for FetchClient<T, C, P>
where
    T: HttpTransport,
    C: ResponseCache,
    P: CredentialProvider,
{
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, ScrapeError> {
        let key = cache_key("GET", url, &options.headers);
        if options.use_cache
            && let Some(mut hit) = self.cache.get(&key).await
        {
            tracing::debug!(%url, "Cache hit");
            hit.from_cache = true;
            return Ok(hit);
        }

        let domain = domain_key(url).unwrap_or_else(|| url.to_string());
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;
        let mut auth_refresh_spent = false;

        loop {
            if options.cancel.is_cancelled() {
                return Err(ScrapeError::Cancelled);
            }

            if options.wait_for_rate_limit {
                tokio::select! {
                    _ = options.cancel.cancelled() => return Err(ScrapeError::Cancelled),
                    _ = self.limiter.acquire(&domain) => {}
                }
            } else {
                self.limiter.try_acquire(&domain).await?;
            }

            let lease = self.acquire_proxy(&options.cancel).await?;

            match self.attempt_once(url, options, &lease).await {
                Outcome::Success(result) => {
                    self.proxies.release(&lease, true);
                    self.limiter.report(&domain, true).await;
                    if options.use_cache {
                        let ttl = options.cache_ttl.unwrap_or(self.config.cache_ttl);
                        if let Err(e) = self.cache.set(&key, result.clone(), ttl).await {
                            tracing::warn!(%url, error = %e, "Failed to cache response");
                        }
                    }
                    tracing::info!(
                        %url,
                        status = result.status_code,
                        attempts = attempt + 1,
                        "Fetch succeeded"
                    );
                    return Ok(result);
                }
                Outcome::Transient(e) => {
                    self.proxies.release(&lease, false);
                    self.limiter.report(&domain, false).await;
                    if attempt + 1 >= max_attempts {
                        tracing::warn!(
                            %url,
                            error = %e,
                            attempts = attempt + 1,
                            "Fetch attempts exhausted"
                        );
                        return Err(e);
                    }
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    tracing::debug!(
                        %url,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Transient fetch failure, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = options.cancel.cancelled() => return Err(ScrapeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Outcome::AuthRejected(status) => {
                    // The connection worked; the rejection is about us.
                    self.proxies.release(&lease, true);
                    self.limiter.report(&domain, true).await;
                    if !auth_refresh_spent && self.credentials.on_auth_failure(status).await {
                        auth_refresh_spent = true;
                        tracing::info!(%url, status, "Credentials refreshed, retrying once");
                        continue;
                    }
                    return Err(ScrapeError::HttpStatus {
                        status,
                        url: url.to_string(),
                    });
                }
                Outcome::Fatal(e) => {
                    self.proxies.release(&lease, true);
                    self.limiter.report(&domain, true).await;
                    return Err(e);
                }
                Outcome::Cancelled => {
                    self.proxies.release(&lease, false);
                    self.limiter.report(&domain, false).await;
                    return Err(ScrapeError::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::proxy::ProxyConfig;
    use crate::ratelimit::RateLimitConfig;
    use crate::testutil::{html_response, json_response, MockTransport, RefreshOnceCredentials};
    use std::time::Instant;

    fn fast_config(max_attempts: u32) -> FetchConfig {
        FetchConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffConfig::new(Duration::from_millis(1)))
    }

    fn fast_limiter() -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::default()
                .with_max_requests(100)
                .with_backoff(BackoffConfig::new(Duration::from_millis(1))),
        )
    }

    #[tokio::test]
    async fn cache_hit_skips_the_transport() {
        let transport = MockTransport::with_responses(vec![Ok(html_response("<h1>Hi</h1>"))]);
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_cache(MemoryCache::new(100));
        let options = FetchOptions::default();

        let first = client.fetch("https://site.test/page", &options).await.unwrap();
        assert!(!first.from_cache);

        let second = client.fetch("https://site.test/page", &options).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.text(), "<h1>Hi</h1>");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn cache_can_be_bypassed_per_call() {
        let transport = MockTransport::with_statuses(&[200, 200]);
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_cache(MemoryCache::new(100));
        let options = FetchOptions::default().use_cache(false);

        client.fetch("https://site.test/page", &options).await.unwrap();
        client.fetch("https://site.test/page", &options).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn transient_statuses_retry_until_success() {
        let transport = MockTransport::with_statuses(&[500, 503, 200]);
        let proxies = ProxyManager::new(vec!["p1".to_string()], ProxyConfig::default());
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_proxies(proxies.clone())
            .with_rate_limiter(fast_limiter());

        let result = client
            .fetch("https://site.test/flaky", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(transport.call_count(), 3);

        // Success wiped the failure streak.
        let status = &proxies.status()[0];
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_without_retry() {
        let transport = MockTransport::with_statuses(&[404]);
        let client = FetchClient::new(transport.clone(), fast_config(3));

        let err = client
            .fetch("https://site.test/missing", &FetchOptions::default())
            .await
            .unwrap_err();
        match err {
            ScrapeError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_the_last_error() {
        let transport = MockTransport::with_statuses(&[500, 502, 503]);
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_rate_limiter(fast_limiter());

        let err = client
            .fetch("https://site.test/down", &FetchOptions::default())
            .await
            .unwrap_err();
        match err {
            ScrapeError::HttpStatus { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn failures_count_against_proxy_and_domain() {
        let transport = MockTransport::with_statuses(&[500, 500, 500, 500]);
        let proxies = ProxyManager::new(
            vec!["p1".to_string()],
            ProxyConfig::default().with_failure_threshold(10),
        );
        let limiter = fast_limiter();
        let client = FetchClient::new(transport.clone(), fast_config(4))
            .with_proxies(proxies.clone())
            .with_rate_limiter(limiter.clone());

        client
            .fetch("https://site.test/down", &FetchOptions::default())
            .await
            .unwrap_err();

        assert_eq!(proxies.status()[0].consecutive_failures, 4);
        assert_eq!(limiter.consecutive_failures("https://site.test").await, 4);
    }

    #[tokio::test]
    async fn opting_out_of_waiting_surfaces_rate_limits() {
        let transport = MockTransport::with_statuses(&[200, 200]);
        let limiter = RateLimiter::new(
            RateLimitConfig::default()
                .with_max_requests(1)
                .with_window(Duration::from_secs(10)),
        );
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_rate_limiter(limiter);
        let options = FetchOptions::default().wait_for_rate_limit(false);

        client.fetch("https://site.test/a", &options).await.unwrap();
        let err = client.fetch("https://site.test/b", &options).await.unwrap_err();
        assert!(matches!(err, ScrapeError::RateLimited(_)));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn auth_rejection_refreshes_and_retries_once() {
        let transport = MockTransport::with_statuses(&[401, 200]);
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_credentials(RefreshOnceCredentials::new("token-1"));

        let result = client
            .fetch("https://site.test/private", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn auth_rejection_without_refresh_fails_immediately() {
        let transport = MockTransport::with_statuses(&[401]);
        let client = FetchClient::new(transport.clone(), fast_config(3));

        let err = client
            .fetch("https://site.test/private", &FetchOptions::default())
            .await
            .unwrap_err();
        match err {
            ScrapeError::HttpStatus { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn auth_refresh_is_spent_after_one_use() {
        let transport = MockTransport::with_statuses(&[401, 401]);
        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_credentials(RefreshOnceCredentials::new("token-1"));

        let err = client
            .fetch("https://site.test/private", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::HttpStatus { status: 401, .. }));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn no_healthy_proxy_gives_up_after_bounded_waits() {
        let transport = MockTransport::with_statuses(&[200]);
        let proxies = ProxyManager::new(
            vec!["p1".to_string()],
            ProxyConfig::default()
                .with_failure_threshold(1)
                .with_cooldown_base(Duration::from_secs(60)),
        );
        // Trip the only proxy.
        let lease = proxies.acquire().unwrap();
        proxies.release(&lease, false);

        let client = FetchClient::new(transport.clone(), fast_config(3))
            .with_proxies(proxies);

        let err = client
            .fetch("https://site.test/page", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::NoHealthyProxy));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let transport = MockTransport::with_statuses(&[200]);
        let client = FetchClient::new(transport.clone(), fast_config(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = FetchOptions::default().with_cancel(cancel);

        let err = client
            .fetch("https://site.test/page", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Cancelled));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_backoff() {
        let transport = MockTransport::with_statuses(&[500, 500, 500, 500, 500]);
        let config = FetchConfig::default()
            .with_max_attempts(5)
            .with_backoff(BackoffConfig::new(Duration::from_secs(30)));
        let client = FetchClient::new(transport.clone(), config)
            .with_rate_limiter(fast_limiter());
        let cancel = CancellationToken::new();
        let options = FetchOptions::default().with_cancel(cancel.clone());

        let started = Instant::now();
        let task = tokio::spawn(async move {
            client.fetch("https://site.test/down", &options).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ScrapeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeouts_are_retried_as_transient() {
        let transport = MockTransport::with_responses(vec![
            Err(ScrapeError::Timeout(Duration::from_secs(5))),
            Ok(html_response("<p>slow but fine</p>")),
        ]);
        let client = FetchClient::new(transport.clone(), fast_config(2))
            .with_rate_limiter(fast_limiter());

        let result = client
            .fetch("https://site.test/slow", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn content_kind_comes_from_the_response_header() {
        let transport =
            MockTransport::with_responses(vec![Ok(json_response(r#"{"items": []}"#))]);
        let client = FetchClient::new(transport, fast_config(3));

        let result = client
            .fetch("https://api.test/items", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content_type, ContentKind::Json);
    }

    #[tokio::test]
    async fn requests_carry_headers_and_proxy() {
        let transport = MockTransport::with_statuses(&[200]);
        let proxies = ProxyManager::new(vec!["http://proxy-1:8080".to_string()], ProxyConfig::default());
        let client = FetchClient::new(transport.clone(), fast_config(3)).with_proxies(proxies);
        let options = FetchOptions::default().with_header("x-custom", "1");

        client.fetch("https://site.test/page", &options).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].proxy.as_deref(), Some("http://proxy-1:8080"));
        assert!(requests[0]
            .headers
            .iter()
            .any(|(name, value)| name == "x-custom" && value == "1"));
    }
}
