//! Content-addressed result cache for document-store queries
//!
//! Entries expire after their TTL. When the cache grows past its byte or
//! entry ceiling, expired entries go first, then the least recently accessed
//! fifth of what remains.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::descriptor::{Conditions, QueryDescriptor};
use super::search::SearchConfig;
use super::QueryContext;
use crate::config::EngineConfig;
use crate::execution::PaginatedResult;

/// Share of entries dropped per eviction sweep
const EVICTION_FRACTION: f64 = 0.2;

/// Deterministic hash of everything that shapes a result
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    entity: &'a str,
    descriptor: &'a QueryDescriptor,
    backend_conditions: &'a Conditions,
    search_config: &'a SearchConfig,
}

impl CacheKey {
    pub fn derive(ctx: &QueryContext, descriptor: &QueryDescriptor) -> Self {
        let material = KeyMaterial {
            entity: &ctx.entity,
            descriptor,
            backend_conditions: &ctx.backend_conditions,
            search_config: &ctx.search_config,
        };
        // Maps serialize in key order, so equal inputs give equal bytes
        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        CacheKey(format!("{}:{:016x}", ctx.entity, fxhash::hash64(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entity part of the key; the digest suffix never contains ':'
    pub fn entity(&self) -> &str {
        self.0
            .rsplit_once(':')
            .map(|(entity, _)| entity)
            .unwrap_or_default()
    }
}

struct CacheEntry {
    result: PaginatedResult,
    created_at: Instant,
    expires_at: Instant,
    /// Logical clock value of the latest read or write
    last_access: u64,
    hits: u64,
    size: usize,
}

pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    total_bytes: AtomicUsize,
    clock: AtomicU64,
    max_entries: usize,
    max_bytes: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self::with_limits(config.cache_max_entries, config.cache_max_bytes, config.cache_ttl())
    }

    pub fn with_limits(max_entries: usize, max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            max_entries: max_entries.max(1),
            max_bytes,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &CacheKey) -> Option<PaginatedResult> {
        let now = Instant::now();
        let mut expired = false;
        let mut found = None;

        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at <= now {
                expired = true;
            } else {
                entry.hits += 1;
                entry.last_access = self.tick();
                found = Some(entry.result.clone());
            }
        }

        if expired {
            self.remove(key);
        }
        match found {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result; `ttl = None` uses the default TTL
    pub fn put(&self, key: CacheKey, result: PaginatedResult, ttl: Option<Duration>) {
        let size = result.approx_size();
        if size > self.max_bytes {
            tracing::debug!(
                "Not caching {}: {} bytes exceeds the {} byte ceiling",
                key.as_str(),
                size,
                self.max_bytes
            );
            return;
        }

        let now = Instant::now();
        let entry = CacheEntry {
            result,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            last_access: self.tick(),
            hits: 0,
            size,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            self.total_bytes.fetch_sub(previous.size, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);

        if self.over_capacity() {
            self.evict();
        }
    }

    fn over_capacity(&self) -> bool {
        self.entries.len() > self.max_entries
            || self.total_bytes.load(Ordering::Relaxed) > self.max_bytes
    }

    fn remove(&self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.total_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Purge expired entries, then least recently accessed ones until within limits
    fn evict(&self) {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        let mut evicted = 0u64;
        for key in &expired {
            if self.remove(key) {
                evicted += 1;
            }
        }

        while self.over_capacity() && !self.entries.is_empty() {
            let mut by_access: Vec<(u64, CacheKey)> = self
                .entries
                .iter()
                .map(|e| (e.value().last_access, e.key().clone()))
                .collect();
            by_access.sort_unstable_by_key(|(at, _)| *at);

            let batch = ((by_access.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
            for (_, key) in by_access.into_iter().take(batch) {
                if self.remove(&key) {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(
                "Evicted {} cache entries ({} expired), {} remain",
                evicted,
                expired.len(),
                self.entries.len()
            );
        }
    }

    /// Drop every entry for an entity
    pub fn invalidate_entity(&self, entity: &str) {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.key().entity() == entity)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Age and hit count of a live entry
    pub fn entry_info(&self, key: &CacheKey) -> Option<(Duration, u64)> {
        self.entries
            .get(key)
            .map(|e| (e.created_at.elapsed(), e.hits))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.entries.len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ttl_secs: self.default_ttl.as_secs(),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub entry_count: usize,
    pub total_bytes: usize,
    pub evictions: u64,
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Record, Value};
    use crate::execution::QueryMetadata;

    fn result(rows: usize) -> PaginatedResult {
        let items = (0..rows)
            .map(|i| {
                let mut r = Record::new();
                r.insert("id".into(), Value::Int64(i as i64));
                r
            })
            .collect();
        PaginatedResult::new(items, rows as u64, None, QueryMetadata::default())
    }

    fn key(n: i64) -> CacheKey {
        let ctx = QueryContext::new("users", "id");
        CacheKey::derive(&ctx, &QueryDescriptor::new().with_condition("n", n))
    }

    #[test]
    fn test_key_is_deterministic() {
        let ctx = QueryContext::new("users", "id");
        let a = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_condition("age", 30)
            .with_pagination(1, 10);
        let b = QueryDescriptor::new()
            .with_condition("age", 30)
            .with_condition("status", "ACTIVE")
            .with_pagination(1, 10);
        assert_eq!(CacheKey::derive(&ctx, &a), CacheKey::derive(&ctx, &b));

        // Pagination is part of the key
        let c = a.clone().with_pagination(2, 10);
        assert_ne!(CacheKey::derive(&ctx, &a), CacheKey::derive(&ctx, &c));

        // So are server-imposed conditions
        let mut tenant = ctx.clone();
        tenant.backend_conditions.insert("tenantId".into(), 7.into());
        assert_ne!(CacheKey::derive(&ctx, &a), CacheKey::derive(&tenant, &a));
        assert_eq!(CacheKey::derive(&ctx, &a).entity(), "users");
    }

    #[test]
    fn test_get_put_and_stats() {
        let cache = ResultCache::with_limits(10, 1 << 20, Duration::from_secs(60));
        assert!(cache.get(&key(1)).is_none());

        cache.put(key(1), result(3), None);
        let hit = cache.get(&key(1)).unwrap();
        assert_eq!(hit.total, 3);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.total_bytes > 0);
        assert_eq!(cache.entry_info(&key(1)).map(|(_, hits)| hits), Some(1));
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = ResultCache::with_limits(10, 1 << 20, Duration::from_secs(60));
        cache.put(key(1), result(1), Some(Duration::ZERO));
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[test]
    fn test_entry_ceiling_evicts_least_recent() {
        let cache = ResultCache::with_limits(10, 1 << 20, Duration::from_secs(60));
        for n in 0..10 {
            cache.put(key(n), result(1), None);
        }
        // Touch the two oldest so they survive
        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1)).is_some());

        cache.put(key(10), result(1), None);
        assert!(cache.len() <= 10);
        assert!(cache.contains(&key(0)));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(10)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_entry_ceiling_purges_oldest_fifth() {
        let cache = ResultCache::with_limits(20, 1 << 20, Duration::from_secs(60));
        for n in 0..20 {
            cache.put(key(n), result(1), None);
        }
        assert_eq!(cache.len(), 20);

        cache.put(key(20), result(1), None);
        // 21 entries over a ceiling of 20: ceil(21 * 0.2) = 5 oldest go
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.stats().evictions, 5);
        for n in 0..5 {
            assert!(!cache.contains(&key(n)), "key {} should be evicted", n);
        }
        for n in 5..=20 {
            assert!(cache.contains(&key(n)), "key {} should survive", n);
        }
    }

    #[test]
    fn test_entity_with_colon() {
        let ctx = QueryContext::new("tenant:orders", "id");
        let key = CacheKey::derive(&ctx, &QueryDescriptor::new());
        assert_eq!(key.entity(), "tenant:orders");

        let cache = ResultCache::new();
        cache.put(key.clone(), result(1), None);
        cache.invalidate_entity("tenant");
        assert!(cache.contains(&key));
        cache.invalidate_entity("tenant:orders");
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_byte_ceiling() {
        let one = result(50).approx_size();
        let cache = ResultCache::with_limits(100, one * 3, Duration::from_secs(60));
        for n in 0..5 {
            cache.put(key(n), result(50), None);
        }
        assert!(cache.stats().total_bytes <= one * 3);
        assert!(cache.contains(&key(4)));

        // Larger than the whole cache: never stored
        cache.put(key(99), result(500), None);
        assert!(!cache.contains(&key(99)));
    }

    #[test]
    fn test_invalidate_entity() {
        let cache = ResultCache::new();
        cache.put(key(1), result(1), None);
        let orders = CacheKey::derive(&QueryContext::new("orders", "id"), &QueryDescriptor::new());
        cache.put(orders.clone(), result(1), None);

        cache.invalidate_entity("users");
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&orders));
    }
}
