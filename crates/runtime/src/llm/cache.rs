//! Response cache keyed by prompt fingerprint.
//!
//! Entries live for a TTL and the cache holds at most `max_size` entries with
//! least-recently-used eviction. Expired entries are treated as misses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

/// Stable hash of prompt + system prompt (+ optional salt), truncated to a
/// hex key. Also used for log correlation.
pub fn fingerprint(prompt: &str, system_prompt: &str, salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(system_prompt.as_bytes());
    if let Some(salt) = salt {
        hasher.update([0u8]);
        hasher.update(salt.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

#[derive(Debug)]
struct CacheEntry {
    response: String,
    inserted_at: Instant,
    /// Monotonic recency stamp; smallest is evicted first.
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU + TTL response cache, safe for concurrent get/insert.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, Duration::from_secs_f64(config.ttl_seconds))
    }

    /// Look up a fingerprint. Expired entries are dropped and count as a miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let clock = inner.clock;
        match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.last_used = clock;
                let response = entry.response.clone();
                inner.hits += 1;
                Some(response)
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a response under its fingerprint, evicting the least recently
    /// used entry on size pressure.
    pub fn insert(&self, key: &str, response: String) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let clock = inner.clock;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                last_used: clock,
            },
        );
        while inner.entries.len() > self.max_size {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                    inner.evictions += 1;
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = fingerprint("hello", "system", None);
        let b = fingerprint("hello", "system", None);
        let c = fingerprint("hello", "other system", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert_ne!(a, fingerprint("hello", "system", Some("salted")));
    }

    #[test]
    fn hit_within_ttl() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let key = fingerprint("p", "s", None);
        assert!(cache.get(&key).is_none());
        cache.insert(&key, "answer".to_string());
        assert_eq!(cache.get(&key).as_deref(), Some("answer"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResponseCache::new(10, Duration::from_millis(5));
        cache.insert("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn lru_eviction_order() {
        // max_size=2: inserting A, B, C evicts A.
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());
        cache.insert("c", "3".to_string());
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some("2"));
        assert_eq!(cache.get("c").as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn access_refreshes_recency() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.insert("a", "1".to_string());
        cache.insert("b", "2".to_string());
        // Touch "a" so "b" is now least recently used.
        assert!(cache.get("a").is_some());
        cache.insert("c", "3".to_string());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn reinsert_replaces_value() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        cache.insert("k", "old".to_string());
        cache.insert("k", "new".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("new"));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn concurrent_access_is_safe() {
        let cache = std::sync::Arc::new(ResponseCache::new(50, Duration::from_secs(60)));
        let mut handles = vec![];
        for i in 0..8 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    let key = format!("k{}", (i * j) % 60);
                    c.insert(&key, format!("v{j}"));
                    c.get(&key);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.stats().entries <= 50);
    }
}
