//! Per-domain request pacing.
//!
//! Each domain gets a sliding window: at most `max_requests` admissions in
//! any `window`-long span. [`RateLimiter::acquire`] waits for a slot rather
//! than dropping the request. Reported failures add a per-domain backoff on
//! top of the window, independent of proxy health.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::backoff::BackoffConfig;
use crate::error::ScrapeError;

/// Pacing configuration applied uniformly to all domains.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admissions allowed per window, per domain.
    pub max_requests: usize,
    /// Length of the sliding window.
    pub window: Duration,
    /// Backoff applied after reported failures.
    pub backoff: BackoffConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(10),
            backoff: BackoffConfig::new(Duration::from_secs(1)).with_jitter(Duration::from_millis(100)),
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Normalize a URL to its pacing domain: scheme, host and explicit port.
///
/// `https://example.com/a` and `https://example.com/b` share a budget;
/// `https://example.com:8443/` does not.
pub fn domain_key(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

#[derive(Debug, Default)]
struct DomainState {
    /// Admission timestamps inside the current window, oldest first.
    admitted: VecDeque<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl DomainState {
    /// Either admit now (recording the slot) or say how long to wait.
    fn next_wait(&mut self, now: Instant, config: &RateLimitConfig) -> Option<Duration> {
        if let Some(until) = self.backoff_until {
            if now < until {
                return Some(until - now);
            }
            self.backoff_until = None;
        }

        while let Some(&front) = self.admitted.front() {
            if front + config.window <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() < config.max_requests {
            self.admitted.push_back(now);
            return None;
        }

        // Window is full; a slot opens when the oldest admission ages out.
        let front = *self.admitted.front()?;
        Some((front + config.window).saturating_duration_since(now))
    }
}

/// Shared pacing state for all domains a scraper touches.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    domains: Arc<Mutex<HashMap<String, DomainState>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait until the domain has a free slot, then take it.
    ///
    /// Never fails and never drops the request. The lock is released while
    /// sleeping so other domains keep flowing.
    pub async fn acquire(&self, domain: &str) {
        loop {
            let wait = {
                let mut domains = self.domains.lock().await;
                let state = domains.entry(domain.to_string()).or_default();
                state.next_wait(Instant::now(), &self.config)
            };
            match wait {
                None => return,
                Some(wait) => {
                    tracing::trace!(%domain, wait_ms = wait.as_millis() as u64, "Rate limit wait");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub async fn try_acquire(&self, domain: &str) -> Result<(), ScrapeError> {
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        match state.next_wait(Instant::now(), &self.config) {
            None => Ok(()),
            Some(wait) => Err(ScrapeError::RateLimited(wait)),
        }
    }

    /// Record the outcome of a request against the domain.
    ///
    /// Failures stack an exponential backoff onto the next admission;
    /// a success clears it.
    pub async fn report(&self, domain: &str, success: bool) {
        let mut domains = self.domains.lock().await;
        let state = domains.entry(domain.to_string()).or_default();
        if success {
            state.consecutive_failures = 0;
            state.backoff_until = None;
            return;
        }
        state.consecutive_failures += 1;
        let delay = self
            .config
            .backoff
            .delay_for_attempt(state.consecutive_failures.saturating_sub(1));
        state.backoff_until = Some(Instant::now() + delay);
        tracing::debug!(
            %domain,
            failures = state.consecutive_failures,
            backoff_ms = delay.as_millis() as u64,
            "Domain backoff extended"
        );
    }

    /// Current failure streak for a domain, for diagnostics.
    pub async fn consecutive_failures(&self, domain: &str) -> u32 {
        let domains = self.domains.lock().await;
        domains
            .get(domain)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }
}
