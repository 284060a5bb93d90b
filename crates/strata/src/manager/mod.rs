//! Tiered memory manager
//!
//! [`TieredMemory`] is the single entry point callers use. It composes the
//! cache tier and the durable tier:
//! - reads search the cache first and fall through to the durable tier for
//!   any shortfall, re-populating the cache in the background
//! - writes drop the cached copy, commit to the durable tier, then cache
//!   the stored version
//! - deletes remove the durable record, then invalidate the cache
//! - access times reach the durable tier in coalesced batches
//!
//! The durable tier is reached through a swappable [`DurableHandle`] so the
//! migration orchestrator can move traffic to a new deployment underneath
//! live callers.

pub mod access;
pub mod locks;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheTier, LocalCache};
use crate::config::Config;
use crate::embedding::{Embedder, check_dimension};
use crate::error::{Result, StrataError};
use crate::memory::{MemoryRecord, Removals, ScoredRecord, TierState, merge_tiers};
use crate::migration::{MigrationHandle, MigrationOrchestrator, MigrationState};
use crate::storage::{
    DEFAULT_DEPLOYMENT, DurableHandle, DurableProvisioner, DurableTier, LanceProvisioner,
    MetadataFilter, RetryPolicy, TargetConfig,
};

pub use access::AccessRecorder;
pub use locks::{KeyGuard, KeyLocks};

/// Writes that may be parked behind a cutover at once
const PENDING_WRITE_LIMIT: usize = 10_000;

/// Snapshot of both tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// `None` when the cache could not be reached
    pub cache_entries: Option<usize>,
    pub durable_records: usize,
    pub active_deployment: String,
    /// Failed durable calls since the active deployment took over
    pub durable_errors: u64,
    /// Writes parked behind an in-progress cutover
    pub pending_writes: usize,
}

/// Two-tier semantic memory store
pub struct TieredMemory {
    cache: Arc<dyn CacheTier>,
    durable: Arc<DurableHandle>,
    config: Arc<Config>,
    locks: KeyLocks,
    /// Bumped by every committed put or delete; background cache fills
    /// started before one are dropped
    writes: Arc<AtomicU64>,
    access: Arc<AccessRecorder>,
    migrations: MigrationOrchestrator,
}

impl TieredMemory {
    /// Open the LanceDB-backed store described by `config`
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let provisioner = Arc::new(LanceProvisioner::from_config(&config));
        let cache = Arc::new(LocalCache::from_config(&config.cache));
        Self::open_with(config, cache, provisioner).await
    }

    /// Open the active deployment through `provisioner`, creating the
    /// default deployment on first use
    pub async fn open_with(
        config: Config,
        cache: Arc<dyn CacheTier>,
        provisioner: Arc<dyn DurableProvisioner>,
    ) -> Result<Self> {
        let durable = match provisioner.active().await? {
            Some(name) => {
                debug!("Opening active deployment {}", name);
                provisioner.open(&name).await?
            }
            None => {
                info!("No active deployment, creating {}", DEFAULT_DEPLOYMENT);
                let tier = provisioner
                    .provision(&TargetConfig::new(DEFAULT_DEPLOYMENT))
                    .await?;
                provisioner.activate(DEFAULT_DEPLOYMENT).await?;
                tier
            }
        };

        Self::with_parts(config, cache, durable, provisioner)
    }

    /// Assemble a manager from already-open tiers
    pub fn with_parts(
        config: Config,
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableTier>,
        provisioner: Arc<dyn DurableProvisioner>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let retry = RetryPolicy::from_config(&config.durable);
        let durable = Arc::new(
            DurableHandle::new(durable, retry)
                .with_pending_limits(PENDING_WRITE_LIMIT, config.migration.cutover_timeout() * 2),
        );
        let migrations = MigrationOrchestrator::new(durable.clone(), provisioner, config.clone());
        let access = AccessRecorder::new(durable.clone(), config.durable.access_flush());

        Ok(Self {
            cache,
            durable,
            config,
            locks: KeyLocks::new(),
            writes: Arc::new(AtomicU64::new(0)),
            access,
            migrations,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn durable(&self) -> &Arc<DurableHandle> {
        &self.durable
    }

    pub fn active_deployment(&self) -> String {
        self.durable.active_name()
    }

    // Reads

    /// Up to `top_k` records most similar to `query`
    pub async fn get(&self, query: &[f32], top_k: usize) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .get_scored(query, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.record)
            .collect())
    }

    /// Like [`get`](Self::get), keeping the similarity of every hit
    pub async fn get_scored(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredRecord>> {
        self.retrieve(query, top_k, None).await
    }

    /// Like [`get`](Self::get), restricted to records matching `filter`
    pub async fn get_filtered(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .retrieve(query, top_k, Some(filter))
            .await?
            .into_iter()
            .map(|hit| hit.record)
            .collect())
    }

    /// Embed `text` and search for it
    pub async fn recall(
        &self,
        embedder: &dyn Embedder,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<MemoryRecord>> {
        check_dimension(embedder, self.config.storage.dimension)?;
        let query = embedder.embed(text)?;
        self.get(&query, top_k).await
    }

    /// Fetch one record from the durable tier
    pub async fn get_record(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.durable
            .get(id)
            .await
            .map_err(|e| classify(e, StrataError::Read))
    }

    async fn retrieve(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        self.check_query(query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let filter = filter.filter(|f| !f.is_empty());

        let mut cache_hits = match self
            .cache
            .search(query, top_k, self.config.cache.similarity_threshold)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Cache search failed, reading from durable tier: {}", e);
                Vec::new()
            }
        };
        if let Some(filter) = filter {
            cache_hits.retain(|hit| filter.matches(&hit.record));
        }

        if cache_hits.len() >= top_k {
            cache_hits.truncate(top_k);
            debug!("Served {} result(s) from cache", cache_hits.len());
            self.touch_detached(&cache_hits);
            return Ok(cache_hits);
        }

        let epoch = self.writes.load(Ordering::SeqCst);
        let durable_hits = self
            .durable
            .search(query, top_k, filter)
            .await
            .map_err(|e| classify(e, StrataError::Read))?;

        let cached: HashSet<Uuid> = cache_hits.iter().map(|hit| hit.record.id).collect();
        let fill: Vec<MemoryRecord> = durable_hits
            .iter()
            .filter(|hit| !cached.contains(&hit.record.id))
            .map(|hit| hit.record.clone())
            .collect();

        debug!(
            "Merging {} cache hit(s) with {} durable hit(s)",
            cache_hits.len(),
            durable_hits.len()
        );
        let merged = merge_tiers(cache_hits, durable_hits, top_k);

        self.fill_cache(fill, epoch);
        self.touch_detached(&merged);
        Ok(merged)
    }

    /// Write-behind cache population for durable-only hits
    fn fill_cache(&self, records: Vec<MemoryRecord>, epoch: u64) {
        if records.is_empty() {
            return;
        }

        let cache = self.cache.clone();
        let locks = self.locks.clone();
        let writes = self.writes.clone();
        let ttl = self.config.cache.ttl();

        tokio::spawn(async move {
            for record in records {
                let id = record.id;
                let _guard = locks.lock(id).await;
                // The read may have returned a version a later write replaced
                if writes.load(Ordering::SeqCst) != epoch {
                    debug!("Dropping cache fill: a write ran since the read");
                    return;
                }

                if let Err(first) = cache.put(record.clone(), ttl).await {
                    debug!("Cache fill for {} failed, retrying once: {}", id, first);
                    if let Err(e) = cache.put(record, ttl).await {
                        warn!("Cache fill for {} failed: {}", id, e);
                    }
                }
            }
        });
    }

    fn touch_detached(&self, hits: &[ScoredRecord]) {
        self.access.record(hits.iter().map(|hit| hit.record.id));
    }

    // Writes

    /// Commit `record` to the durable tier, then cache it.
    ///
    /// Re-putting an existing id merges metadata key by key (last writer wins
    /// on overlapping keys) and unions relationships; keys and relationships
    /// named with `without_*` are removed. `embedding` and `content` must be
    /// unchanged. Returns the record as stored.
    ///
    /// The cached copy is dropped before the durable write, so a failed
    /// cache refresh afterwards leaves a miss rather than the old version.
    pub async fn put(&self, record: MemoryRecord) -> Result<MemoryRecord> {
        record.validate(self.config.storage.dimension)?;

        let guard = self.locks.lock(record.id).await;
        let existing = self
            .durable
            .get(record.id)
            .await
            .map_err(|e| classify(e, StrataError::Write))?;

        let version = existing.as_ref().map_or(1, |current| current.version + 1);
        let mut stored = match &existing {
            Some(current) => current.merge_update(&record)?,
            None => record,
        };
        stored.version = version;
        stored.updated_at = Utc::now();
        stored.tier_state = TierState::DurableOnly;
        stored.removals = Removals::default();

        if let Err(e) = self.cache.invalidate(stored.id).await {
            warn!("Failed to drop cached copy of {}: {}", stored.id, e);
        }

        self.durable
            .write(&stored)
            .await
            .map_err(|e| classify(e, StrataError::Write))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!("Stored record {} (version {})", stored.id, stored.version);

        let cache = self.cache.clone();
        let ttl = self.config.cache.ttl();
        let cached = stored.clone();
        tokio::spawn(async move {
            // Held until the cache agrees with the durable write
            let _guard = guard;
            let id = cached.id;
            if let Err(e) = cache.put(cached, ttl).await {
                warn!("Cache write for {} failed: {}", id, e);
                if let Err(e) = cache.invalidate(id).await {
                    warn!("Failed to drop cached copy of {}: {}", id, e);
                }
            }
        });

        Ok(stored)
    }

    /// Permanently remove a record from both tiers
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let existed = self
            .durable
            .delete(id)
            .await
            .map_err(|e| classify(e, StrataError::Delete))?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.cache.invalidate(id).await {
            warn!("Failed to invalidate cached copy of {}: {}", id, e);
        }

        if !existed {
            return Err(StrataError::NotFound(id));
        }
        debug!("Deleted record {}", id);
        Ok(())
    }

    /// Load a durable record into the cache with the default TTL
    pub async fn promote(&self, id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let record = self
            .durable
            .get(id)
            .await
            .map_err(|e| classify(e, StrataError::Read))?
            .ok_or(StrataError::NotFound(id))?;
        self.cache.put(record, self.config.cache.ttl()).await
    }

    /// Drop every cached entry. The durable tier is untouched.
    pub async fn flush_cache(&self) -> Result<()> {
        self.cache.clear().await
    }

    /// Build the ANN index on the active deployment
    pub async fn build_index(&self) -> Result<bool> {
        self.durable.build_index().await
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        let cache_entries = match self.cache.entry_count().await {
            Ok(entries) => Some(entries),
            Err(e) => {
                debug!("Cache entry count unavailable: {}", e);
                None
            }
        };
        let durable_records = self
            .durable
            .count()
            .await
            .map_err(|e| classify(e, StrataError::Read))?;

        Ok(MemoryStats {
            cache_entries,
            durable_records,
            active_deployment: self.durable.active_name(),
            durable_errors: self.durable.error_count(),
            pending_writes: self.durable.pending_count(),
        })
    }

    // Migration

    pub fn migrations(&self) -> &MigrationOrchestrator {
        &self.migrations
    }

    /// Start moving the durable tier to a new deployment
    pub async fn start_migration(&self, target: TargetConfig) -> Result<MigrationHandle> {
        self.migrations.start(target).await
    }

    pub fn migration_status(&self, handle: &MigrationHandle) -> MigrationState {
        self.migrations.status(handle)
    }

    pub async fn rollback_migration(&self, handle: &MigrationHandle) -> Result<()> {
        self.migrations.rollback(handle).await
    }

    pub async fn resume_migration(&self, id: Uuid) -> Result<MigrationHandle> {
        self.migrations.resume(id).await
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        let dimension = self.config.storage.dimension;
        if query.len() != dimension {
            return Err(StrataError::InvalidRecord(format!(
                "query has dimension {}, expected {}",
                query.len(),
                dimension
            )));
        }
        Ok(())
    }
}

/// Keep errors callers act on distinctly; fold the rest into the
/// operation's own error kind
fn classify(error: StrataError, wrap: fn(String) -> StrataError) -> StrataError {
    match error {
        e @ (StrataError::Timeout { .. }
        | StrataError::ResourceExhausted(_)
        | StrataError::InvalidRecord(_)
        | StrataError::NotFound(_)
        | StrataError::Write(_)
        | StrataError::Read(_)
        | StrataError::Delete(_)) => e,
        other => wrap(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FailingCache, FaultyDurable, FlakyCache, InMemoryDurable, MemoryProvisioner, unit_vector,
    };
    use std::time::Duration;

    const DIM: usize = 8;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.storage.dimension = DIM;
        config.durable.retry_base_delay_ms = 1;
        config
    }

    fn manager_with(
        cache: Arc<dyn CacheTier>,
        durable: Arc<dyn DurableTier>,
    ) -> TieredMemory {
        TieredMemory::with_parts(
            test_config(),
            cache,
            durable,
            Arc::new(MemoryProvisioner::new()),
        )
        .unwrap()
    }

    fn manager() -> (TieredMemory, Arc<LocalCache>, Arc<InMemoryDurable>) {
        let cache = Arc::new(LocalCache::new(100));
        let durable = Arc::new(InMemoryDurable::new("primary"));
        (manager_with(cache.clone(), durable.clone()), cache, durable)
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    mod put_tests {
        use super::*;

        #[tokio::test]
        async fn test_put_then_get_roundtrip() {
            let (memory, _cache, _durable) = manager();
            let record = MemoryRecord::new("hello", unit_vector(DIM, 0));

            let stored = memory.put(record.clone()).await.unwrap();
            assert_eq!(stored.version, 1);

            let hits = memory.get_scored(&record.embedding, 1).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].record.id, record.id);
            assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_put_rejects_wrong_dimension_before_touching_tiers() {
            let (memory, cache, durable) = manager();
            let record = MemoryRecord::new("bad", vec![1.0; DIM + 1]);

            let err = memory.put(record).await.unwrap_err();
            assert!(matches!(err, StrataError::InvalidRecord(_)));
            assert!(durable.is_empty());
            assert_eq!(cache.stats().entries, 0);
        }

        #[tokio::test]
        async fn test_reput_merges_and_bumps_version() {
            let (memory, _cache, durable) = manager();
            let id = Uuid::new_v4();
            let base = MemoryRecord::with_id(id, "note", unit_vector(DIM, 1));

            memory
                .put(base.clone().with_metadata("source", "chat"))
                .await
                .unwrap();
            let stored = memory
                .put(base.clone().with_metadata("topic", "rust"))
                .await
                .unwrap();

            assert_eq!(stored.version, 2);
            assert_eq!(stored.metadata.len(), 2);
            assert_eq!(durable.len(), 1);
        }

        #[tokio::test]
        async fn test_reput_with_new_content_is_rejected() {
            let (memory, _cache, _durable) = manager();
            let id = Uuid::new_v4();
            memory
                .put(MemoryRecord::with_id(id, "first", unit_vector(DIM, 2)))
                .await
                .unwrap();

            let err = memory
                .put(MemoryRecord::with_id(id, "second", unit_vector(DIM, 2)))
                .await
                .unwrap_err();
            assert!(matches!(err, StrataError::InvalidRecord(_)));
        }

        #[tokio::test]
        async fn test_failed_durable_write_is_never_cached() {
            let cache = Arc::new(LocalCache::new(100));
            let durable = Arc::new(FaultyDurable::new(Arc::new(InMemoryDurable::new("primary"))));
            durable.inject(|f| f.write_failures = 10);
            let memory = manager_with(cache.clone(), durable.clone());

            let record = MemoryRecord::new("lost", unit_vector(DIM, 3));
            let err = memory.put(record.clone()).await.unwrap_err();

            assert!(matches!(err, StrataError::Write(_)));
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!cache.contains(&record.id));
            assert!(!durable.inner().contains(record.id));
        }

        #[tokio::test]
        async fn test_failed_cache_refresh_never_serves_old_version() {
            let cache = Arc::new(FlakyCache::new(100));
            let memory = manager_with(cache.clone(), Arc::new(InMemoryDurable::new("primary")));
            let id = Uuid::new_v4();
            let base = MemoryRecord::with_id(id, "status", unit_vector(DIM, 3));

            memory
                .put(base.clone().with_metadata("status", "draft"))
                .await
                .unwrap();
            assert!(eventually(|| cache.inner().contains(&id)).await);

            cache.fail_puts(true);
            memory
                .put(base.with_metadata("status", "final"))
                .await
                .unwrap();

            let hits = memory.get(&unit_vector(DIM, 3), 1).await.unwrap();
            assert_eq!(hits[0].version, 2);
            assert_eq!(
                hits[0].metadata.get("status"),
                Some(&crate::memory::MetadataValue::from("final"))
            );
        }

        #[tokio::test]
        async fn test_fill_started_before_a_write_is_dropped() {
            let cache = Arc::new(FlakyCache::new(100));
            let memory = manager_with(cache.clone(), Arc::new(InMemoryDurable::new("primary")));
            let id = Uuid::new_v4();
            let base = MemoryRecord::with_id(id, "fill", unit_vector(DIM, 4));

            let old = memory.put(base.clone()).await.unwrap();
            assert!(eventually(|| cache.inner().contains(&id)).await);
            let epoch = memory.writes.load(Ordering::SeqCst);

            cache.fail_puts(true);
            memory.put(base.with_metadata("k", "v")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!cache.inner().contains(&id));

            // A read that saw version 1 before the write tries to fill late
            cache.fail_puts(false);
            memory.fill_cache(vec![old], epoch);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!cache.inner().contains(&id));
        }

        #[tokio::test]
        async fn test_put_populates_cache() {
            let (memory, cache, _durable) = manager();
            let record = MemoryRecord::new("cached", unit_vector(DIM, 4));
            memory.put(record.clone()).await.unwrap();

            assert!(eventually(|| cache.contains(&record.id)).await);
        }
    }

    mod get_tests {
        use super::*;

        #[tokio::test]
        async fn test_get_zero_top_k_is_empty() {
            let (memory, _cache, _durable) = manager();
            assert!(memory.get(&unit_vector(DIM, 0), 0).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_get_rejects_wrong_query_dimension() {
            let (memory, _cache, _durable) = manager();
            let err = memory.get(&[1.0; 3], 1).await.unwrap_err();
            assert!(matches!(err, StrataError::InvalidRecord(_)));
        }

        #[tokio::test]
        async fn test_durable_hits_fill_the_cache() {
            let (memory, cache, durable) = manager();
            let record = MemoryRecord::new("cold", unit_vector(DIM, 5));
            durable.write(&record).await.unwrap();

            let hits = memory.get(&record.embedding, 1).await.unwrap();
            assert_eq!(hits[0].id, record.id);
            assert_eq!(hits[0].tier_state, TierState::DurableOnly);

            assert!(eventually(|| cache.contains(&record.id)).await);
        }

        #[tokio::test]
        async fn test_failing_cache_degrades_to_durable() {
            let cache = Arc::new(FailingCache::new());
            let durable = Arc::new(InMemoryDurable::new("primary"));
            let memory = manager_with(cache.clone(), durable);

            let record = MemoryRecord::new("survives", unit_vector(DIM, 6));
            memory.put(record.clone()).await.unwrap();
            let hits = memory.get(&record.embedding, 1).await.unwrap();

            assert_eq!(hits[0].id, record.id);
            assert!(cache.calls() > 0);
        }

        #[tokio::test]
        async fn test_durable_read_failure_is_surfaced() {
            let cache = Arc::new(LocalCache::new(100));
            let durable = Arc::new(FaultyDurable::new(Arc::new(InMemoryDurable::new("primary"))));
            durable.inject(|f| f.fail_everything = true);
            let memory = manager_with(cache, durable);

            let err = memory.get(&unit_vector(DIM, 0), 3).await.unwrap_err();
            assert!(matches!(err, StrataError::Read(_)));
        }

        #[tokio::test]
        async fn test_get_filtered() {
            let (memory, _cache, _durable) = manager();
            let query = unit_vector(DIM, 0);
            let chat = MemoryRecord::new("a", query.clone()).with_metadata("source", "chat");
            let mut near = query.clone();
            near[1] = 0.1;
            let email = MemoryRecord::new("b", near).with_metadata("source", "email");
            memory.put(chat).await.unwrap();
            memory.put(email.clone()).await.unwrap();

            let filter = MetadataFilter::new().with_eq("source", "email");
            let hits = memory.get_filtered(&query, 5, &filter).await.unwrap();

            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].id, email.id);
        }
    }

    mod delete_tests {
        use super::*;

        #[tokio::test]
        async fn test_delete_removes_from_both_tiers() {
            let (memory, cache, durable) = manager();
            let record = MemoryRecord::new("gone", unit_vector(DIM, 7));
            memory.put(record.clone()).await.unwrap();
            assert!(eventually(|| cache.contains(&record.id)).await);

            memory.delete(record.id).await.unwrap();

            assert!(!durable.contains(record.id));
            assert!(!cache.contains(&record.id));
            assert!(memory.get(&record.embedding, 1).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_delete_missing_is_not_found() {
            let (memory, _cache, _durable) = manager();
            let id = Uuid::new_v4();
            let err = memory.delete(id).await.unwrap_err();
            assert!(matches!(err, StrataError::NotFound(missing) if missing == id));
        }
    }

    mod promote_tests {
        use super::*;

        #[tokio::test]
        async fn test_promote_after_flush() {
            let (memory, cache, _durable) = manager();
            let record = MemoryRecord::new("warm", unit_vector(DIM, 0));
            memory.put(record.clone()).await.unwrap();
            assert!(eventually(|| cache.contains(&record.id)).await);

            memory.flush_cache().await.unwrap();
            assert!(!cache.contains(&record.id));

            memory.promote(record.id).await.unwrap();
            assert!(cache.contains(&record.id));
        }

        #[tokio::test]
        async fn test_promote_missing_is_not_found() {
            let (memory, _cache, _durable) = manager();
            let err = memory.promote(Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, StrataError::NotFound(_)));
        }

        #[tokio::test]
        async fn test_promote_surfaces_cache_failure() {
            let durable = Arc::new(InMemoryDurable::new("primary"));
            let record = MemoryRecord::new("x", unit_vector(DIM, 0));
            durable.write(&record).await.unwrap();
            let memory = manager_with(Arc::new(FailingCache::new()), durable);

            let err = memory.promote(record.id).await.unwrap_err();
            assert!(matches!(err, StrataError::CacheUnavailable(_)));
        }
    }

    #[test]
    fn test_with_parts_validates_config() {
        let mut config = test_config();
        config.migration.batch_size = 0;

        let result = TieredMemory::with_parts(
            config,
            Arc::new(LocalCache::new(10)),
            Arc::new(InMemoryDurable::new("primary")),
            Arc::new(MemoryProvisioner::new()),
        );
        assert!(matches!(result, Err(StrataError::Config(_))));
    }

    #[tokio::test]
    async fn test_stats() {
        let (memory, _cache, _durable) = manager();
        memory
            .put(MemoryRecord::new("a", unit_vector(DIM, 0)))
            .await
            .unwrap();

        let stats = memory.stats().await.unwrap();
        assert_eq!(stats.durable_records, 1);
        assert_eq!(stats.active_deployment, "primary");
        assert_eq!(stats.pending_writes, 0);
    }

    #[test]
    fn test_classify_keeps_caller_facing_errors() {
        let timeout = classify(StrataError::timeout("search", 10), StrataError::Read);
        assert!(matches!(timeout, StrataError::Timeout { .. }));

        let storage = classify(StrataError::Storage("disk".into()), StrataError::Read);
        assert!(matches!(storage, StrataError::Read(msg) if msg.contains("disk")));
    }
}
