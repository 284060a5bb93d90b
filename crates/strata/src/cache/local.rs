//! In-process LRU cache tier
//!
//! Entries are kept in an LRU ordered by access; each carries its own expiry
//! instant. Searches are a linear cosine scan over live entries, which keeps
//! results exact for the bounded sizes a cache holds.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::CacheTier;
use crate::config::CacheConfig;
use crate::error::{Result, StrataError};
use crate::memory::{MemoryRecord, ScoredRecord, TierState, cosine_similarity, rank_by_similarity};

/// Default capacity when a zero capacity is requested
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct CacheEntry {
    record: MemoryRecord,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Capacity-bounded in-memory cache tier
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<LruCache<Uuid, CacheEntry>>,
    counters: Counters,
}

impl LocalCache {
    /// Create a cache holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries)
    }

    /// Maximum number of records held
    pub fn capacity(&self) -> usize {
        self.lock().map(|entries| entries.cap().get()).unwrap_or(0)
    }

    /// Snapshot of the hit/miss/eviction counters
    pub fn stats(&self) -> CacheStats {
        let entries = self.lock().map(|entries| entries.len()).unwrap_or(0);
        CacheStats {
            entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    /// Whether `id` is present and unexpired. Does not affect recency.
    pub fn contains(&self, id: &Uuid) -> bool {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.peek(id).is_some_and(|e| !e.is_expired(now)))
            .unwrap_or(false)
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        match self.lock() {
            Ok(mut entries) => self.purge_locked(&mut entries, Instant::now()),
            Err(_) => 0,
        }
    }

    fn purge_locked(&self, entries: &mut LruCache<Uuid, CacheEntry>, now: Instant) -> usize {
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.pop(id);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<Uuid, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| StrataError::CacheUnavailable("cache lock poisoned".to_string()))
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[async_trait]
impl CacheTier for LocalCache {
    async fn put(&self, mut record: MemoryRecord, ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        if ttl.is_zero() {
            entries.pop(&record.id);
            return Ok(());
        }

        if let Some(existing) = entries.peek(&record.id) {
            if !existing.is_expired(now) && existing.record.version > record.version {
                tracing::debug!(
                    "Skipping cache put for {}: cached version {} is newer than {}",
                    record.id,
                    existing.record.version,
                    record.version
                );
                return Ok(());
            }
        } else if entries.len() >= entries.cap().get() {
            self.purge_locked(&mut entries, now);
        }

        record.tier_state = TierState::Both;
        let id = record.id;
        let entry = CacheEntry {
            record,
            expires_at: now + ttl,
        };

        if let Some((evicted, _)) = entries.push(id, entry) {
            if evicted != id {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Evicted {} from cache under capacity pressure", evicted);
            }
        }

        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut entries = self.lock()?;
        let now = Instant::now();
        self.purge_locked(&mut entries, now);

        let mut hits: Vec<ScoredRecord> = entries
            .iter()
            .filter_map(|(_, entry)| {
                let similarity = cosine_similarity(query, &entry.record.embedding);
                (similarity >= similarity_threshold)
                    .then(|| ScoredRecord::new(entry.record.clone(), similarity))
            })
            .collect();

        rank_by_similarity(&mut hits);
        hits.truncate(top_k);

        if hits.is_empty() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(hits);
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        let accessed_at = Utc::now();
        for hit in &mut hits {
            hit.record.last_accessed_at = accessed_at;
            if let Some(entry) = entries.get_mut(&hit.record.id) {
                entry.record.last_accessed_at = accessed_at;
            }
        }

        Ok(hits)
    }

    async fn invalidate(&self, id: Uuid) -> Result<()> {
        self.lock()?.pop(&id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    async fn entry_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn record(embedding: Vec<f32>) -> MemoryRecord {
        MemoryRecord::new("cached", embedding)
    }

    /// Unit vector at `angle` radians in the first two dimensions
    fn at_angle(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin(), 0.0, 0.0, 0.0]
    }

    mod put_and_search {
        use super::*;

        #[tokio::test]
        async fn test_exact_match_is_returned() {
            let cache = LocalCache::new(10);
            let r = record(at_angle(0.0));
            cache.put(r.clone(), TTL).await.unwrap();

            let hits = cache.search(&r.embedding, 1, 0.85).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].record.id, r.id);
            assert!((hits[0].similarity - 1.0).abs() < 1e-6);
            assert_eq!(hits[0].record.tier_state, TierState::Both);
        }

        #[tokio::test]
        async fn test_threshold_is_inclusive() {
            let cache = LocalCache::new(10);
            let r = record(vec![1.0, 0.0, 0.0, 0.0, 0.0]);
            cache.put(r.clone(), TTL).await.unwrap();

            let at_boundary = [17.0, 10.0, 3.0, 1.0, 1.0];
            let hits = cache.search(&at_boundary, 5, 0.85).await.unwrap();
            assert_eq!(hits.len(), 1, "similarity exactly at threshold must be included");

            let below = 0.849999_f64;
            let just_below = [below as f32, (1.0 - below * below).sqrt() as f32, 0.0, 0.0, 0.0];
            let hits = cache.search(&just_below, 5, 0.85).await.unwrap();
            assert!(hits.is_empty(), "similarity below threshold must be excluded");
        }

        #[tokio::test]
        async fn test_results_ordered_by_similarity() {
            let cache = LocalCache::new(10);
            let near = record(at_angle(0.1));
            let nearer = record(at_angle(0.05));
            let far = record(at_angle(1.2));
            for r in [&near, &nearer, &far] {
                cache.put(r.clone(), TTL).await.unwrap();
            }

            let hits = cache.search(&at_angle(0.0), 10, 0.85).await.unwrap();
            let ids: Vec<Uuid> = hits.iter().map(|h| h.record.id).collect();
            assert_eq!(ids, vec![nearer.id, near.id]);
        }

        #[tokio::test]
        async fn test_top_k_limits_results() {
            let cache = LocalCache::new(10);
            for i in 0..5 {
                cache.put(record(at_angle(0.01 * i as f32)), TTL).await.unwrap();
            }

            let hits = cache.search(&at_angle(0.0), 3, 0.5).await.unwrap();
            assert_eq!(hits.len(), 3);
            assert!(cache.search(&at_angle(0.0), 0, 0.5).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_no_match_is_empty_not_error() {
            let cache = LocalCache::new(10);
            cache.put(record(at_angle(0.0)), TTL).await.unwrap();

            let hits = cache.search(&at_angle(1.5), 5, 0.85).await.unwrap();
            assert!(hits.is_empty());
            assert_eq!(cache.stats().misses, 1);
        }

        #[tokio::test]
        async fn test_older_version_does_not_replace_newer() {
            let cache = LocalCache::new(10);
            let mut newer = record(at_angle(0.0)).with_metadata("rev", "new");
            newer.version = 2;
            let mut older = newer.clone().with_metadata("rev", "old");
            older.version = 1;

            cache.put(newer.clone(), TTL).await.unwrap();
            cache.put(older, TTL).await.unwrap();

            let hits = cache.search(&newer.embedding, 1, 0.85).await.unwrap();
            assert_eq!(hits[0].record.version, 2);
            assert_eq!(hits[0].record.metadata["rev"], crate::memory::MetadataValue::from("new"));
        }
    }

    mod expiry {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_entry_expires_after_ttl() {
            let cache = LocalCache::new(10);
            let r = record(at_angle(0.0));
            cache.put(r.clone(), Duration::from_secs(1)).await.unwrap();

            tokio::time::advance(Duration::from_millis(900)).await;
            assert_eq!(cache.search(&r.embedding, 1, 0.85).await.unwrap().len(), 1);

            tokio::time::advance(Duration::from_millis(200)).await;
            assert!(cache.search(&r.embedding, 1, 0.85).await.unwrap().is_empty());
            assert!(!cache.contains(&r.id));
            assert_eq!(cache.stats().expirations, 1);
        }

        #[tokio::test]
        async fn test_zero_ttl_removes_entry() {
            let cache = LocalCache::new(10);
            let r = record(at_angle(0.0));
            cache.put(r.clone(), TTL).await.unwrap();
            cache.put(r.clone(), Duration::ZERO).await.unwrap();
            assert!(!cache.contains(&r.id));
        }
    }

    mod eviction {
        use super::*;

        #[tokio::test]
        async fn test_capacity_evicts_least_recently_accessed() {
            let cache = LocalCache::new(2);
            let a = record(at_angle(0.0));
            let b = record(at_angle(1.0));
            let c = record(at_angle(2.0));

            cache.put(a.clone(), TTL).await.unwrap();
            cache.put(b.clone(), TTL).await.unwrap();
            // touching `a` makes `b` the LRU entry
            assert_eq!(cache.search(&a.embedding, 1, 0.99).await.unwrap().len(), 1);
            cache.put(c.clone(), TTL).await.unwrap();

            assert!(cache.contains(&a.id));
            assert!(!cache.contains(&b.id));
            assert!(cache.contains(&c.id));
            assert_eq!(cache.stats().evictions, 1);
        }

        #[tokio::test]
        async fn test_long_ttl_does_not_protect_from_lru() {
            let cache = LocalCache::new(1);
            let a = record(at_angle(0.0));
            let b = record(at_angle(1.0));
            cache.put(a.clone(), Duration::from_secs(86_400)).await.unwrap();
            cache.put(b.clone(), Duration::from_secs(1)).await.unwrap();

            assert!(!cache.contains(&a.id));
            assert!(cache.contains(&b.id));
        }
    }

    mod invalidation {
        use super::*;

        #[tokio::test]
        async fn test_invalidate_is_idempotent() {
            let cache = LocalCache::new(10);
            let r = record(at_angle(0.0));
            cache.put(r.clone(), TTL).await.unwrap();

            cache.invalidate(r.id).await.unwrap();
            cache.invalidate(r.id).await.unwrap();
            cache.invalidate(Uuid::new_v4()).await.unwrap();

            assert!(!cache.contains(&r.id));
            assert_eq!(cache.entry_count().await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_clear_drops_everything() {
            let cache = LocalCache::new(10);
            for i in 0..4 {
                cache.put(record(at_angle(i as f32)), TTL).await.unwrap();
            }
            cache.clear().await.unwrap();
            assert_eq!(cache.entry_count().await.unwrap(), 0);
        }
    }
}
