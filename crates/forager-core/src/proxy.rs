//! Proxy pool with health tracking and exponential cooldown.
//!
//! Proxies rotate round-robin. A proxy that fails repeatedly is marked
//! unhealthy and sidelined for a cooldown period that doubles on every
//! failed comeback, capped. Once the cooldown elapses the proxy becomes
//! eligible again without requiring a success first, so a single probe
//! request decides whether it rejoins the rotation or cools down longer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::ScrapeError;

/// Tuning knobs for proxy health bookkeeping.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Consecutive failures before a proxy is marked unhealthy.
    pub failure_threshold: u32,
    /// Cooldown after the first trip; doubles on each subsequent trip.
    pub cooldown_base: Duration,
    /// Upper bound on any cooldown.
    pub cooldown_cap: Duration,
    /// When set, a proxy serves at most one request at a time.
    pub exclusive: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(300),
            exclusive: false,
        }
    }
}

impl ProxyConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown_base(mut self, base: Duration) -> Self {
        self.cooldown_base = base;
        self
    }

    pub fn with_cooldown_cap(mut self, cap: Duration) -> Self {
        self.cooldown_cap = cap;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Handle to a proxy slot handed out by [`ProxyManager::acquire`].
///
/// A lease with no address means "connect directly"; releasing it is a
/// no-op. Every lease must be released exactly once with the outcome of
/// the request it served.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    address: Option<String>,
}

impl ProxyLease {
    /// Lease representing a direct connection (no proxy).
    pub fn direct() -> Self {
        Self { address: None }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_direct(&self) -> bool {
        self.address.is_none()
    }
}

/// Health snapshot for one proxy, for diagnostics.
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    pub address: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub in_use: bool,
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug)]
struct ProxyRecord {
    address: String,
    in_use: bool,
    consecutive_failures: u32,
    /// How many times this proxy has tripped without recovering. Drives
    /// the cooldown doubling.
    trips: u32,
    healthy: bool,
    cooldown_until: Option<Instant>,
    last_used_at: Option<Instant>,
}

impl ProxyRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            in_use: false,
            consecutive_failures: 0,
            trips: 0,
            healthy: true,
            cooldown_until: None,
            last_used_at: None,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    records: Vec<ProxyRecord>,
    cursor: usize,
}

/// Rotating proxy pool shared across fetch tasks.
#[derive(Clone)]
pub struct ProxyManager {
    config: ProxyConfig,
    inner: Arc<Mutex<PoolInner>>,
}

impl ProxyManager {
    pub fn new(addresses: Vec<String>, config: ProxyConfig) -> Self {
        let records = addresses.into_iter().map(ProxyRecord::new).collect();
        Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner { records, cursor: 0 })),
        }
    }

    /// A manager with no proxies: every acquire yields a direct lease.
    pub fn direct() -> Self {
        Self::new(Vec::new(), ProxyConfig::default())
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Proxy pool lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Pick the next usable proxy, round-robin from where the last pick
    /// left off.
    ///
    /// An empty pool is not an error: it yields a direct lease. A non-empty
    /// pool where every proxy is unhealthy (and still cooling down) or busy
    /// fails with [`ScrapeError::NoHealthyProxy`], which is retryable.
    pub fn acquire(&self) -> Result<ProxyLease, ScrapeError> {
        let mut inner = self.lock_inner();
        if inner.records.is_empty() {
            return Ok(ProxyLease::direct());
        }

        let now = Instant::now();
        let len = inner.records.len();
        let start = inner.cursor;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let record = &inner.records[idx];
            if self.config.exclusive && record.in_use {
                continue;
            }
            let eligible = record.healthy || record.cooldown_elapsed(now);
            if !eligible {
                continue;
            }
            if !record.healthy {
                tracing::info!(proxy = %record.address, "Cooldown elapsed, probing proxy");
            }
            inner.cursor = (idx + 1) % len;
            let record = &mut inner.records[idx];
            record.in_use = true;
            record.last_used_at = Some(now);
            let address = record.address.clone();
            return Ok(ProxyLease {
                address: Some(address),
            });
        }

        Err(ScrapeError::NoHealthyProxy)
    }

    /// Return a lease with the outcome of the request it served.
    ///
    /// Success resets the failure count and restores health. Failure counts
    /// toward the threshold; at the threshold the proxy trips and enters
    /// cooldown, and a failure during a cooldown probe doubles the next
    /// cooldown (up to the cap).
    pub fn release(&self, lease: &ProxyLease, success: bool) {
        let Some(address) = lease.address() else {
            return;
        };
        let mut inner = self.lock_inner();
        let Some(record) = inner.records.iter_mut().find(|r| r.address == address) else {
            return;
        };
        record.in_use = false;

        if success {
            record.consecutive_failures = 0;
            record.trips = 0;
            record.healthy = true;
            record.cooldown_until = None;
            return;
        }

        if record.healthy {
            record.consecutive_failures += 1;
            if record.consecutive_failures >= self.config.failure_threshold {
                record.healthy = false;
                record.trips = 1;
                let cooldown = self.cooldown_for(1);
                record.cooldown_until = Some(Instant::now() + cooldown);
                tracing::warn!(
                    proxy = %record.address,
                    failures = record.consecutive_failures,
                    cooldown_secs = cooldown.as_secs_f64(),
                    "Proxy marked unhealthy"
                );
            }
        } else {
            // Failed probe: stay unhealthy, back off for longer.
            record.consecutive_failures += 1;
            record.trips = record.trips.saturating_add(1);
            let cooldown = self.cooldown_for(record.trips);
            record.cooldown_until = Some(Instant::now() + cooldown);
            tracing::info!(
                proxy = %record.address,
                trips = record.trips,
                cooldown_secs = cooldown.as_secs_f64(),
                "Proxy probe failed, extending cooldown"
            );
        }
    }

    fn cooldown_for(&self, trips: u32) -> Duration {
        let base_ms = self.config.cooldown_base.as_millis() as u64;
        let factor = 2u64.saturating_pow(trips.saturating_sub(1));
        let ms = base_ms
            .saturating_mul(factor)
            .min(self.config.cooldown_cap.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Health snapshot of the whole pool.
    pub fn status(&self) -> Vec<ProxyStatus> {
        let inner = self.lock_inner();
        let now = Instant::now();
        inner
            .records
            .iter()
            .map(|r| ProxyStatus {
                address: r.address.clone(),
                healthy: r.healthy,
                consecutive_failures: r.consecutive_failures,
                in_use: r.in_use,
                cooldown_remaining: r
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .filter(|d| !d.is_zero()),
            })
            .collect()
    }

    /// Proxies currently eligible for selection on health grounds.
    pub fn healthy_count(&self) -> usize {
        let inner = self.lock_inner();
        let now = Instant::now();
        inner
            .records
            .iter()
            .filter(|r| r.healthy || r.cooldown_elapsed(now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(addresses: &[&str], config: ProxyConfig) -> ProxyManager {
        ProxyManager::new(addresses.iter().map(|s| s.to_string()).collect(), config)
    }

    fn fail_n(manager: &ProxyManager, n: usize) {
        for _ in 0..n {
            let lease = manager.acquire().unwrap();
            manager.release(&lease, false);
        }
    }

    #[test]
    fn rotates_round_robin() {
        let manager = pool(&["p1", "p2", "p3"], ProxyConfig::default());
        let picks: Vec<String> = (0..5)
            .map(|_| {
                let lease = manager.acquire().unwrap();
                let addr = lease.address().unwrap().to_string();
                manager.release(&lease, true);
                addr
            })
            .collect();
        assert_eq!(picks, ["p1", "p2", "p3", "p1", "p2"]);
    }

    #[test]
    fn empty_pool_yields_direct_lease() {
        let manager = ProxyManager::direct();
        let lease = manager.acquire().unwrap();
        assert!(lease.is_direct());
        assert_eq!(lease.address(), None);
        // Releasing a direct lease is harmless.
        manager.release(&lease, false);
    }

    #[test]
    fn threshold_failures_sideline_a_proxy() {
        let config = ProxyConfig::default().with_cooldown_base(Duration::from_secs(30));
        let manager = pool(&["bad", "good"], config);

        // Fail "bad" three times, succeeding on "good" as rotation hands it out.
        let mut bad_failures = 0;
        while bad_failures < 3 {
            let lease = manager.acquire().unwrap();
            if lease.address() == Some("bad") {
                manager.release(&lease, false);
                bad_failures += 1;
            } else {
                manager.release(&lease, true);
            }
        }

        let status = manager.status();
        let bad = status.iter().find(|s| s.address == "bad").unwrap();
        assert!(!bad.healthy);
        assert!(bad.cooldown_remaining.is_some());

        // Only "good" is selectable now.
        for _ in 0..3 {
            let lease = manager.acquire().unwrap();
            assert_eq!(lease.address(), Some("good"));
            manager.release(&lease, true);
        }
    }

    #[test]
    fn all_unhealthy_is_a_retryable_error() {
        let config = ProxyConfig::default()
            .with_failure_threshold(1)
            .with_cooldown_base(Duration::from_secs(60));
        let manager = pool(&["p1", "p2"], config);
        fail_n(&manager, 2);

        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, ScrapeError::NoHealthyProxy));
        assert!(err.is_retryable());
        assert_eq!(manager.healthy_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_elapse_restores_eligibility_without_success() {
        let config = ProxyConfig::default()
            .with_failure_threshold(1)
            .with_cooldown_base(Duration::from_millis(10));
        let manager = pool(&["p1"], config);
        fail_n(&manager, 1);
        assert!(manager.acquire().is_err());

        tokio::time::sleep(Duration::from_millis(25)).await;
        // Eligible again purely because the cooldown elapsed.
        let lease = manager.acquire().unwrap();
        assert_eq!(lease.address(), Some("p1"));
        manager.release(&lease, true);
        assert!(manager.status()[0].healthy);
    }

    #[tokio::test]
    async fn failed_probe_doubles_the_cooldown() {
        let config = ProxyConfig::default()
            .with_failure_threshold(1)
            .with_cooldown_base(Duration::from_millis(100))
            .with_cooldown_cap(Duration::from_secs(10));
        let manager = pool(&["p1"], config);
        fail_n(&manager, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let lease = manager.acquire().unwrap();
        manager.release(&lease, false);

        // Second trip: cooldown is 200ms, so well over 120ms must remain.
        let remaining = manager.status()[0].cooldown_remaining.unwrap();
        assert!(remaining > Duration::from_millis(120), "remaining {remaining:?}");
    }

    #[test]
    fn cooldown_growth_is_capped() {
        let config = ProxyConfig::default()
            .with_cooldown_base(Duration::from_secs(30))
            .with_cooldown_cap(Duration::from_secs(300));
        let manager = pool(&["p1"], config);
        assert_eq!(manager.cooldown_for(1), Duration::from_secs(30));
        assert_eq!(manager.cooldown_for(2), Duration::from_secs(60));
        assert_eq!(manager.cooldown_for(3), Duration::from_secs(120));
        assert_eq!(manager.cooldown_for(4), Duration::from_secs(240));
        assert_eq!(manager.cooldown_for(5), Duration::from_secs(300));
        assert_eq!(manager.cooldown_for(50), Duration::from_secs(300));
    }

    #[test]
    fn success_resets_failure_count() {
        let manager = pool(&["p1"], ProxyConfig::default());
        fail_n(&manager, 2);
        assert_eq!(manager.status()[0].consecutive_failures, 2);

        let lease = manager.acquire().unwrap();
        manager.release(&lease, true);
        assert_eq!(manager.status()[0].consecutive_failures, 0);

        // Two fresh failures still sit below the threshold of three.
        fail_n(&manager, 2);
        assert!(manager.status()[0].healthy);
    }

    #[test]
    fn exclusive_mode_skips_leased_proxies() {
        let config = ProxyConfig::default().with_exclusive(true);
        let manager = pool(&["p1"], config);

        let first = manager.acquire().unwrap();
        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, ScrapeError::NoHealthyProxy));

        manager.release(&first, true);
        assert!(manager.acquire().is_ok());
    }
}
