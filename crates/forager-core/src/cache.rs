//! Response caching behind a pluggable backend.
//!
//! A cache hit within TTL short-circuits the whole fetch path: no rate-limit
//! admission, no proxy, no network. Expired entries behave as misses and are
//! purged opportunistically.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::content::FetchResult;
use crate::error::ScrapeError;

/// Derive a stable cache key from the request shape.
///
/// Identical (method, url, headers) always produce the same key. Header
/// names are lowercased and the list sorted, so header ordering never
/// changes the key.
pub fn cache_key(method: &str, url: &str, headers: &[(String, String)]) -> String {
    let mut normalized: Vec<String> = headers
        .iter()
        .map(|(name, value)| format!("{}:{}", name.to_ascii_lowercase(), value))
        .collect();
    normalized.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    for line in &normalized {
        hasher.update(b"\n");
        hasher.update(line.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Storage backend for fetched responses.
pub trait ResponseCache: Send + Sync + Clone {
    /// Look up a cached response. Missing and expired entries are both misses.
    fn get(&self, key: &str) -> impl Future<Output = Option<FetchResult>> + Send;

    /// Store a response under `key` for `ttl`, replacing any existing entry.
    fn set(
        &self,
        key: &str,
        value: FetchResult,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), ScrapeError>> + Send;

    /// Drop an entry if present.
    fn invalidate(&self, key: &str) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct TimedEntry {
    value: FetchResult,
    /// None = never expires (TTL too large to represent).
    expires_at: Option<Instant>,
}

/// Per-entry expiry policy so each insert can carry its own TTL.
struct EntryTtl;

impl moka::Expiry<String, TimedEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TimedEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        value
            .expires_at
            .map(|at| at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TimedEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value
            .expires_at
            .map(|at| at.saturating_duration_since(updated_at))
    }
}

/// In-memory response cache with per-entry TTL.
#[derive(Clone)]
pub struct MemoryCache {
    entries: moka::future::Cache<String, TimedEntry>,
}

impl MemoryCache {
    /// Cache bounded to `capacity` entries; least-recently-used beyond that.
    pub fn new(capacity: u64) -> Self {
        let entries = moka::future::Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryTtl)
            .build();
        Self { entries }
    }

    /// Entries currently held, including ones pending eviction.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<FetchResult> {
        let entry = self.entries.get(key).await?;
        // The expiry policy evicts eagerly, but its timer has granularity;
        // the deadline check here is what callers can rely on.
        if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
            self.entries.invalidate(key).await;
            return None;
        }
        Some(entry.value)
    }

    async fn set(&self, key: &str, value: FetchResult, ttl: Duration) -> Result<(), ScrapeError> {
        let entry = TimedEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }
}

// ---------------------------------------------------------------------------
// DiskCache
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    value: FetchResult,
    expires_at: DateTime<Utc>,
}

/// Disk-backed response cache storing one JSON file per key.
///
/// Unreadable or corrupt entries are removed and reported as misses, so a
/// damaged cache degrades to re-fetching instead of failing the scrape.
#[derive(Clone)]
pub struct DiskCache {
    dir: Arc<PathBuf>,
}

impl DiskCache {
    /// Open (and create if needed) a cache directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ScrapeError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ScrapeError::Cache(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir: Arc::new(dir) })
    }

    /// File path for a key. Keys are hashed so arbitrary strings stay
    /// filesystem-safe.
    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{digest:x}.json"))
    }

    async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache entry");
        }
    }
}

impl ResponseCache for DiskCache {
    async fn get(&self, key: &str) -> Option<FetchResult> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable cache entry, treating as miss");
                return None;
            }
        };
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt cache entry, discarding");
                self.remove(&path).await;
                return None;
            }
        };
        if Utc::now() >= entry.expires_at {
            self.remove(&path).await;
            return None;
        }
        Some(entry.value)
    }

    async fn set(&self, key: &str, value: FetchResult, ttl: Duration) -> Result<(), ScrapeError> {
        let expires_at = chrono::TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = DiskEntry { value, expires_at };
        let bytes = serde_json::to_vec(&entry)?;
        let path = self.path_for(key);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ScrapeError::Cache(format!("cannot write {}: {e}", path.display())))
    }

    async fn invalidate(&self, key: &str) {
        self.remove(&self.path_for(key)).await;
    }
}

// ---------------------------------------------------------------------------
// NullCache
// ---------------------------------------------------------------------------

/// A no-op cache for cache-disabled operation. Every lookup misses.
#[derive(Debug, Clone)]
pub struct NullCache;

impl ResponseCache for NullCache {
    async fn get(&self, _key: &str) -> Option<FetchResult> {
        None
    }

    async fn set(&self, _key: &str, _value: FetchResult, _ttl: Duration) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn invalidate(&self, _key: &str) {}
}
