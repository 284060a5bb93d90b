//! Cache tier
//!
//! A fast, non-authoritative projection of the durable tier. Everything in
//! it may be dropped at any time; the manager treats any cache error as a miss.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::memory::{MemoryRecord, ScoredRecord};

pub use local::{CacheStats, LocalCache};

/// Similarity-searchable store with per-entry expiry
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Store `record` until `ttl` elapses or capacity pressure evicts it.
    ///
    /// An entry holding a newer `version` of the same id is left in place.
    async fn put(&self, record: MemoryRecord, ttl: Duration) -> Result<()>;

    /// Up to `top_k` live records with cosine similarity >= `similarity_threshold`,
    /// most similar first, ties broken by most recent access.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord>>;

    /// Drop `id` immediately. Absent ids are not an error.
    async fn invalidate(&self, id: Uuid) -> Result<()>;

    /// Drop every entry
    async fn clear(&self) -> Result<()>;

    /// Number of entries not yet purged
    async fn entry_count(&self) -> Result<usize>;
}
