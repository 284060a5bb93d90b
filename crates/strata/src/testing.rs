//! Test utilities for strata - in-memory tiers, fault injection and mocks
//!
//! These let manager and migration tests run without touching disk:
//! - [`InMemoryDurable`]: exact-search durable tier
//! - [`FaultyDurable`]: wraps a tier and fails on demand
//! - [`FailingCache`]: a cache that is always down
//! - [`FlakyCache`]: a cache whose writes fail on demand
//! - [`MemoryProvisioner`]: hands out in-memory deployments
//! - [`MockEmbedder`]: deterministic text embeddings

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::{CacheTier, LocalCache};
use crate::embedding::Embedder;
use crate::error::{Result, StrataError};
use crate::memory::{MemoryRecord, ScoredRecord, TierState, rank_by_similarity};
use crate::storage::{DurableProvisioner, DurableTier, MetadataFilter, TargetConfig};

/// A vector with a single 1.0 at `axis`
pub fn unit_vector(dimension: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimension];
    if dimension > 0 {
        v[axis % dimension] = 1.0;
    }
    v
}

/// Pseudo-random vector in [-1, 1], fully determined by `seed`
pub fn deterministic_embedding(seed: u64, dimension: usize) -> Vec<f32> {
    let mut state = seed.wrapping_add(0x9e3779b97f4a7c15);
    (0..dimension)
        .map(|_| {
            // splitmix64
            state = state.wrapping_add(0x9e3779b97f4a7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            z ^= z >> 31;
            let normalized = (z >> 40) as f32 / (1u64 << 24) as f32;
            (normalized * 2.0) - 1.0
        })
        .collect()
}

/// Embeds text by hashing it into [`deterministic_embedding`]
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        Ok(deterministic_embedding(hasher.finish(), self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Durable tier backed by a `BTreeMap`, with exact (brute force) search
#[derive(Debug, Default)]
pub struct InMemoryDurable {
    name: String,
    records: Mutex<BTreeMap<Uuid, MemoryRecord>>,
    destroyed: AtomicBool,
}

impl InMemoryDurable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        lock(&self.records).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        lock(&self.records).values().cloned().collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableTier for InMemoryDurable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &MemoryRecord) -> Result<()> {
        let mut stored = record.clone();
        stored.tier_state = TierState::DurableOnly;
        lock(&self.records).insert(record.id, stored);
        Ok(())
    }

    async fn write_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        for record in records {
            self.write(record).await?;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        let mut results: Vec<ScoredRecord> = lock(&self.records)
            .values()
            .filter(|record| filter.is_none_or(|f| f.matches(record)))
            .map(|record| ScoredRecord::score(query, record.clone()))
            .collect();
        rank_by_similarity(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(lock(&self.records).remove(&id).is_some())
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let records = lock(&self.records);
        let page = match after {
            Some(after) => records
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => records.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn ids(&self) -> Result<Vec<Uuid>> {
        Ok(lock(&self.records).keys().copied().collect())
    }

    async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.len())
    }

    async fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        let mut records = lock(&self.records);
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.last_accessed_at = at;
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        lock(&self.records).clear();
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Fault switches for [`FaultyDurable`]
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail this many upcoming writes before touching the data
    pub write_failures: u32,
    /// Delete, then report failure, this many times
    pub delete_failures_after_commit: u32,
    /// Fail this many upcoming searches
    pub search_failures: u32,
    /// Searches succeed but return nothing
    pub empty_search: bool,
    /// Every call fails
    pub fail_everything: bool,
    /// Added to every call
    pub latency: Option<Duration>,
    /// Added to `count` only
    pub count_latency: Option<Duration>,
}

/// Wraps an [`InMemoryDurable`] and injects failures
#[derive(Debug)]
pub struct FaultyDurable {
    inner: Arc<InMemoryDurable>,
    faults: Mutex<Faults>,
    calls: AtomicUsize,
}

impl FaultyDurable {
    pub fn new(inner: Arc<InMemoryDurable>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Adjust the active faults
    pub fn inject(&self, change: impl FnOnce(&mut Faults)) {
        change(&mut lock(&self.faults));
    }

    pub fn heal(&self) {
        *lock(&self.faults) = Faults::default();
    }

    pub fn inner(&self) -> &Arc<InMemoryDurable> {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (latency, fail) = {
            let faults = lock(&self.faults);
            (faults.latency, faults.fail_everything)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(StrataError::Storage(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = lock(&self.faults);
        let remaining = pick(&mut faults);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DurableTier for FaultyDurable {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn write(&self, record: &MemoryRecord) -> Result<()> {
        self.enter("write").await?;
        if self.take_fault(|f| &mut f.write_failures) {
            return Err(StrataError::Storage("injected write failure".to_string()));
        }
        self.inner.write(record).await
    }

    async fn write_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        self.enter("write").await?;
        if self.take_fault(|f| &mut f.write_failures) {
            return Err(StrataError::Storage("injected write failure".to_string()));
        }
        self.inner.write_batch(records).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.enter("get").await?;
        self.inner.get(id).await
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        self.enter("search").await?;
        if self.take_fault(|f| &mut f.search_failures) {
            return Err(StrataError::Storage("injected search failure".to_string()));
        }
        if lock(&self.faults).empty_search {
            return Ok(Vec::new());
        }
        self.inner.search(query, top_k, filter).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.enter("delete").await?;
        let existed = self.inner.delete(id).await?;
        if self.take_fault(|f| &mut f.delete_failures_after_commit) {
            return Err(StrataError::Storage("injected delete failure".to_string()));
        }
        Ok(existed)
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.enter("scan").await?;
        self.inner.scan(after, limit).await
    }

    async fn ids(&self) -> Result<Vec<Uuid>> {
        self.enter("ids").await?;
        self.inner.ids().await
    }

    async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        self.enter("modified_since").await?;
        self.inner.modified_since(since).await
    }

    async fn count(&self) -> Result<usize> {
        self.enter("count").await?;
        let latency = lock(&self.faults).count_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.inner.count().await
    }

    async fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        self.enter("touch").await?;
        self.inner.touch(ids, at).await
    }

    async fn destroy(&self) -> Result<()> {
        self.inner.destroy().await
    }
}

/// A cache tier whose every call fails
#[derive(Debug, Default)]
pub struct FailingCache {
    calls: AtomicUsize,
}

impl FailingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StrataError::CacheUnavailable("injected cache outage".to_string()))
    }
}

#[async_trait]
impl CacheTier for FailingCache {
    async fn put(&self, _record: MemoryRecord, _ttl: Duration) -> Result<()> {
        self.fail()
    }

    async fn search(
        &self,
        _query: &[f32],
        _top_k: usize,
        _similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        self.fail()
    }

    async fn invalidate(&self, _id: Uuid) -> Result<()> {
        self.fail()
    }

    async fn clear(&self) -> Result<()> {
        self.fail()
    }

    async fn entry_count(&self) -> Result<usize> {
        self.fail()
    }
}

/// A [`LocalCache`] whose `put` can be made to fail while every other call
/// keeps working
#[derive(Debug)]
pub struct FlakyCache {
    inner: LocalCache,
    fail_puts: AtomicBool,
}

impl FlakyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LocalCache::new(capacity),
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &LocalCache {
        &self.inner
    }
}

#[async_trait]
impl CacheTier for FlakyCache {
    async fn put(&self, record: MemoryRecord, ttl: Duration) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StrataError::CacheUnavailable("injected put failure".to_string()));
        }
        self.inner.put(record, ttl).await
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        self.inner.search(query, top_k, similarity_threshold).await
    }

    async fn invalidate(&self, id: Uuid) -> Result<()> {
        self.inner.invalidate(id).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn entry_count(&self) -> Result<usize> {
        self.inner.entry_count().await
    }
}

/// Provisioner that hands out in-memory deployments.
///
/// Tiers registered with [`MemoryProvisioner::register`] are returned as-is,
/// which lets tests provision a [`FaultyDurable`] target.
#[derive(Default)]
pub struct MemoryProvisioner {
    tiers: Mutex<HashMap<String, Arc<dyn DurableTier>>>,
    active: Mutex<Option<String>>,
    provisioned: Mutex<Vec<TargetConfig>>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, tier: Arc<dyn DurableTier>) {
        lock(&self.tiers).insert(name.into(), tier);
    }

    /// Every target passed to `provision`, in order
    pub fn provisioned(&self) -> Vec<TargetConfig> {
        lock(&self.provisioned).clone()
    }
}

#[async_trait]
impl DurableProvisioner for MemoryProvisioner {
    async fn provision(&self, target: &TargetConfig) -> Result<Arc<dyn DurableTier>> {
        lock(&self.provisioned).push(target.clone());
        let mut tiers = lock(&self.tiers);
        let tier = tiers.entry(target.deployment.clone()).or_insert_with(|| {
            Arc::new(InMemoryDurable::new(target.deployment.clone())) as Arc<dyn DurableTier>
        });
        Ok(tier.clone())
    }

    async fn open(&self, deployment: &str) -> Result<Arc<dyn DurableTier>> {
        lock(&self.tiers)
            .get(deployment)
            .cloned()
            .ok_or_else(|| StrataError::Storage(format!("unknown deployment {deployment}")))
    }

    async fn activate(&self, deployment: &str) -> Result<()> {
        *lock(&self.active) = Some(deployment.to_string());
        Ok(())
    }

    async fn active(&self) -> Result<Option<String>> {
        Ok(lock(&self.active).clone())
    }

    async fn existing_records(&self, deployment: &str) -> Result<Option<usize>> {
        let tier = lock(&self.tiers).get(deployment).cloned();
        match tier {
            Some(tier) => Ok(Some(tier.count().await?)),
            None => Ok(None),
        }
    }
}
