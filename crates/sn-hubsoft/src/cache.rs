//! Keyed TTL cache for upstream lookups.
//!
//! Three categories with their own TTLs, LRU eviction at capacity, and
//! hit/miss/eviction counters exported through the `metrics` facade. No
//! persistence; a restart starts cold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

pub const MAX_ENTRIES: usize = 1000;

/// Reduced TTL for negative lookups, so a client activated upstream is not
/// invisible for hours.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    ClientData,
    ContractStatus,
    ServiceData,
}

impl CacheCategory {
    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheCategory::ClientData => Duration::from_secs(30 * 60),
            CacheCategory::ContractStatus => Duration::from_secs(4 * 60 * 60),
            CacheCategory::ServiceData => Duration::from_secs(60 * 60),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            CacheCategory::ClientData => "client_data",
            CacheCategory::ContractStatus => "contract_status",
            CacheCategory::ServiceData => "service_data",
        }
    }
}

struct Entry {
    value: serde_json::Value,
    created_at: Instant,
    ttl: Duration,
    last_access: Instant,
    access_count: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub entries: usize,
}

pub struct ApiCache {
    inner: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
}

impl Default for ApiCache {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }
}

impl ApiCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    fn key(category: CacheCategory, identifier: &str) -> String {
        format!("{}:{}", category.prefix(), identifier)
    }

    pub fn get(&self, category: CacheCategory, identifier: &str) -> Option<serde_json::Value> {
        let key = Self::key(category, identifier);
        let now = Instant::now();
        let mut map = self.inner.lock();

        match map.get_mut(&key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hubsoft.cache.hits_total").increment(1);
                Some(entry.value.clone())
            }
            Some(_) => {
                map.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hubsoft.cache.misses_total").increment(1);
                metrics::counter!("hubsoft.cache.evictions_total").increment(1);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hubsoft.cache.misses_total").increment(1);
                None
            }
        }
    }

    pub fn put(
        &self,
        category: CacheCategory,
        identifier: &str,
        value: serde_json::Value,
        ttl_override: Option<Duration>,
    ) {
        let key = Self::key(category, identifier);
        let ttl = ttl_override.unwrap_or_else(|| category.default_ttl());
        let now = Instant::now();
        let mut map = self.inner.lock();

        if map.len() >= self.max_entries && !map.contains_key(&key) {
            self.evict_lru(&mut map);
        }

        map.insert(
            key,
            Entry {
                value,
                created_at: now,
                ttl,
                last_access: now,
                access_count: 0,
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hubsoft.cache.sets_total").increment(1);
    }

    pub fn invalidate(&self, category: CacheCategory, identifier: &str) -> bool {
        let key = Self::key(category, identifier);
        let removed = self.inner.lock().remove(&key).is_some();
        if removed {
            debug!(key = %key, "Cache entry invalidated");
        }
        removed
    }

    pub fn invalidate_category(&self, category: CacheCategory) -> usize {
        let prefix = format!("{}:", category.prefix());
        let mut map = self.inner.lock();
        let keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            map.remove(key);
        }
        keys.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        if !expired.is_empty() {
            self.evictions.fetch_add(expired.len() as u64, Ordering::Relaxed);
            metrics::counter!("hubsoft.cache.evictions_total").increment(expired.len() as u64);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            entries: self.inner.lock().len(),
        }
    }

    fn evict_lru(&self, map: &mut HashMap<String, Entry>) {
        let lru = map
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());
        if let Some(key) = lru {
            map.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("hubsoft.cache.evictions_total").increment(1);
            debug!(key = %key, "Cache LRU eviction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn round_trip_within_ttl() {
        let cache = ApiCache::new();
        cache.put(
            CacheCategory::ClientData,
            "11144477735",
            json!({"name": "Alice"}),
            None,
        );
        assert_eq!(
            cache.get(CacheCategory::ClientData, "11144477735"),
            Some(json!({"name": "Alice"}))
        );
    }

    #[test]
    fn expires_after_ttl() {
        let cache = ApiCache::new();
        cache.put(
            CacheCategory::ClientData,
            "k",
            json!(1),
            Some(Duration::from_millis(20)),
        );
        assert!(cache.get(CacheCategory::ClientData, "k").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(CacheCategory::ClientData, "k").is_none());
    }

    #[test]
    fn categories_do_not_collide() {
        let cache = ApiCache::new();
        cache.put(CacheCategory::ClientData, "k", json!("client"), None);
        cache.put(CacheCategory::ContractStatus, "k", json!(true), None);
        assert_eq!(cache.get(CacheCategory::ClientData, "k"), Some(json!("client")));
        assert_eq!(cache.get(CacheCategory::ContractStatus, "k"), Some(json!(true)));

        assert_eq!(cache.invalidate_category(CacheCategory::ClientData), 1);
        assert!(cache.get(CacheCategory::ClientData, "k").is_none());
        assert!(cache.get(CacheCategory::ContractStatus, "k").is_some());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = ApiCache::with_capacity(2);
        cache.put(CacheCategory::ClientData, "a", json!(1), None);
        cache.put(CacheCategory::ClientData, "b", json!(2), None);

        // Touch "a" so "b" is the least recently used.
        cache.get(CacheCategory::ClientData, "a");
        cache.put(CacheCategory::ClientData, "c", json!(3), None);

        assert!(cache.get(CacheCategory::ClientData, "a").is_some());
        assert!(cache.get(CacheCategory::ClientData, "b").is_none());
        assert!(cache.get(CacheCategory::ClientData, "c").is_some());
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn counters_track_hits_and_misses() {
        let cache = ApiCache::new();
        cache.get(CacheCategory::ServiceData, "missing");
        cache.put(CacheCategory::ServiceData, "k", json!(1), None);
        cache.get(CacheCategory::ServiceData, "k");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.entries, 1);
    }

    fn any_category() -> impl Strategy<Value = CacheCategory> {
        prop_oneof![
            Just(CacheCategory::ClientData),
            Just(CacheCategory::ContractStatus),
            Just(CacheCategory::ServiceData),
        ]
    }

    proptest! {
        // Each case sleeps past a short TTL; keep the case count low.
        #![proptest_config(ProptestConfig::with_cases(16))]

        // Round-trip law: get(put(k, v, ttl)) = v while now < put_time +
        // ttl, and None after expiry.
        #[test]
        fn round_trip_respects_ttl(
            category in any_category(),
            key in "[a-z0-9]{1,12}",
            value in any::<i64>(),
        ) {
            let cache = ApiCache::new();
            let value = json!(value);

            // Fresh entry, generous TTL: must read back.
            cache.put(category, &key, value.clone(), Some(Duration::from_secs(60)));
            prop_assert_eq!(cache.get(category, &key), Some(value.clone()));

            // Re-put with a TTL that lapses before the read: must be gone.
            cache.put(category, &key, value, Some(Duration::from_millis(5)));
            std::thread::sleep(Duration::from_millis(15));
            prop_assert_eq!(cache.get(category, &key), None);
        }
    }
}
