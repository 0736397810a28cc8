//! In-memory result cache with per-call TTL.
//!
//! Keys are a SHA-256 digest of the call namespace plus its arguments. There
//! is no background sweeper: when the map grows past `max_entries` a bounded
//! batch of entries older than twice the TTL is reclaimed on insert. Misses
//! are not single-flighted, two concurrent identical misses both run the call.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub eviction_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            eviction_batch: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Shared TTL cache.
#[derive(Debug)]
pub struct ResultCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic key for a call.
    pub fn key(namespace: &str, args: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        for arg in args {
            hasher.update([0x1f]);
            hasher.update(arg.as_bytes());
        }
        format!("{namespace}:{}", hex::encode(hasher.finalize()))
    }

    /// Value stored under `key` if it is younger than `ttl`.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        (entry.stored_at.elapsed() < ttl).then(|| entry.value.clone())
    }

    pub async fn insert(&self, key: String, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );

        if entries.len() > self.config.max_entries {
            let horizon = ttl * 2;
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.stored_at.elapsed() > horizon)
                .map(|(key, _)| key.clone())
                .take(self.config.eviction_batch.max(1))
                .collect();
            for key in &stale {
                entries.remove(key);
            }
            if !stale.is_empty() {
                log::debug!("cache reclaimed {} stale entries", stale.len());
            }
        }
    }

    /// Wrap a call: return the cached value on a hit, otherwise run `call`
    /// and store its value.
    pub async fn cached<F, Fut>(&self, key: String, ttl: Duration, call: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(hit) = self.get(&key, ttl).await {
            log::debug!("cache hit {key}");
            return hit;
        }
        let value = call().await;
        self.insert(key, value.clone(), ttl).await;
        value
    }

    /// Like [`ResultCache::cached`] but only successful values are stored.
    pub async fn try_cached<F, Fut, E>(&self, key: String, ttl: Duration, call: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key, ttl).await {
            log::debug!("cache hit {key}");
            return Ok(hit);
        }
        let value = call().await?;
        self.insert(key, value.clone(), ttl).await;
        Ok(value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn keys_are_deterministic() {
        let a = ResultCache::<u8>::key("vk", &["durov"]);
        let b = ResultCache::<u8>::key("vk", &["durov"]);
        let c = ResultCache::<u8>::key("instagram", &["durov"]);
        let d = ResultCache::<u8>::key("vk", &["dur", "ov"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl_skips_the_call() {
        let cache = ResultCache::default();
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(60);
        let key = ResultCache::<usize>::key("test", &["a"]);

        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            calls.load(Ordering::SeqCst)
        };

        assert_eq!(cache.cached(key.clone(), ttl, run).await, 1);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.cached(key.clone(), ttl, run).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.cached(key, ttl, run).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_cached() {
        let cache: ResultCache<u32> = ResultCache::default();
        let key = ResultCache::<u32>::key("test", &["err"]);
        let ttl = Duration::from_secs(60);

        let first: Result<u32, &str> = cache.try_cached(key.clone(), ttl, || async { Err("boom") }).await;
        assert!(first.is_err());
        let second: Result<u32, &str> = cache.try_cached(key.clone(), ttl, || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        let third: Result<u32, &str> = cache.try_cached(key, ttl, || async { Ok(8) }).await;
        assert_eq!(third, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_reclaims_entries_older_than_twice_the_ttl() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 3,
            eviction_batch: 10,
        });
        let ttl = Duration::from_secs(10);
        for i in 0..3 {
            cache.insert(format!("old{i}"), i, ttl).await;
        }
        tokio::time::advance(Duration::from_secs(21)).await;
        cache.insert("fresh".into(), 99, ttl).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("fresh", ttl).await, Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_keeps_entries_younger_than_twice_the_ttl() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 1,
            eviction_batch: 10,
        });
        let ttl = Duration::from_secs(10);
        cache.insert("a".into(), 1, ttl).await;
        tokio::time::advance(Duration::from_secs(15)).await;
        cache.insert("b".into(), 2, ttl).await;
        assert_eq!(cache.len().await, 2);
    }
}
