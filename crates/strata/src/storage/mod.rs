//! Durable tier
//!
//! The authoritative store. [`DurableTier`] is the seam the manager and the
//! migration orchestrator talk to; [`LanceStore`] is the LanceDB-backed
//! implementation and [`DurableHandle`] is the atomically swappable reference
//! the manager holds.

pub mod deployment;
pub mod filter;
pub mod handle;
pub mod lance;
pub mod pool;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::{MemoryRecord, ScoredRecord};

pub use deployment::{DEFAULT_DEPLOYMENT, DurableProvisioner, LanceProvisioner, TargetConfig};
pub use filter::MetadataFilter;
pub use handle::{DurableHandle, PendingOp};
pub use lance::LanceStore;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use retry::RetryPolicy;

/// Persistent, vector-indexed record store
#[async_trait]
pub trait DurableTier: Send + Sync {
    /// Deployment name this tier was opened as
    fn name(&self) -> &str;

    /// Upsert by id. Returns only once the record is committed.
    async fn write(&self, record: &MemoryRecord) -> Result<()>;

    /// Upsert several records in one commit
    async fn write_batch(&self, records: &[MemoryRecord]) -> Result<()>;

    /// Fetch a record by id
    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// Nearest neighbours of `query`, optionally restricted by metadata equality
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>>;

    /// Remove a record. Returns false if it was not present.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Up to `limit` records with id strictly greater than `after`, ascending by id.
    ///
    /// A pass that feeds each page's last id back as `after` may see the
    /// store as of its first page; records inserted later can be missed.
    /// Migration covers them with its write journal.
    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Every stored id
    async fn ids(&self) -> Result<Vec<Uuid>>;

    /// Records whose `updated_at` is at or after `since`
    async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MemoryRecord>>;

    /// Number of stored records
    async fn count(&self) -> Result<usize>;

    /// Set `last_accessed_at` for the given ids
    async fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()>;

    /// Build or rebuild the ANN index. Returns false when there is too little
    /// data to train one.
    async fn build_index(&self) -> Result<bool> {
        Ok(false)
    }

    /// Permanently remove this deployment's data
    async fn destroy(&self) -> Result<()>;
}
