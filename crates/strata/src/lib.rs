//! Strata - tiered semantic memory
//!
//! Records carrying an embedding are stored in a LanceDB durable tier and
//! served through an in-process similarity cache. The durable tier can be
//! migrated to a new deployment (for example with a different ANN layout)
//! while the store stays online.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod manager;
pub mod memory;
pub mod migration;
pub mod storage;
pub mod testing;

pub use config::Config;
pub use error::{Result, StrataError};
pub use manager::{MemoryStats, TieredMemory};
pub use memory::{MemoryRecord, MetadataValue, ScoredRecord, TierState};
pub use migration::{MigrationHandle, MigrationState, MigrationStatus};
pub use storage::{MetadataFilter, TargetConfig};
