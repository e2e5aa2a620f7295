//! Bounded LRU response cache with per-entry TTL.

use dispatch_core::Fingerprint;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Whether lookups and inserts do anything
    pub enabled: bool,
    /// Maximum number of entries
    pub capacity: usize,
    /// Default time to live
    pub ttl: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 500,
            ttl: Duration::from_secs(3600),
        }
    }
}

struct CacheEntry {
    value: String,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Current number of entries
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Values stored
    pub insertions: u64,
    /// Entries pushed out by capacity
    pub evictions: u64,
    /// Entries dropped because their TTL passed
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Completed response text keyed by fingerprint
pub struct ResponseCache {
    config: ResponseCacheConfig,
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// Create a cache
    #[must_use]
    pub fn new(config: ResponseCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Whether the cache is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a fingerprint. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &Fingerprint) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %key.short(), "Cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with the default TTL
    pub fn put(&self, key: Fingerprint, value: String) {
        self.put_with_ttl(key, value, self.config.ttl);
    }

    /// Store a value with an explicit TTL, evicting the least recently used
    /// entry at capacity.
    pub fn put_with_ttl(&self, key: Fingerprint, value: String, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        let mut entries = self.entries.lock();
        // `push` hands back either the replaced value or the evicted pair
        if let Some((old_key, _)) = entries.push(key.clone(), entry) {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(evicted = %old_key.short(), "Cache evicted least recently used entry");
            }
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a live entry exists. Does not touch recency or statistics.
    #[must_use]
    pub fn contains(&self, key: &Fingerprint) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remove one entry
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(purged = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, expired ones included until purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters, keeping the entries
    pub fn reset_stats(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.insertions,
            &self.evictions,
            &self.expirations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(ResponseCacheConfig::default())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
