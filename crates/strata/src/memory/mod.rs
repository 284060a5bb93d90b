//! Memory record types and similarity ranking
//!
//! Defines the record shared by the cache and durable tiers and the
//! scoring helpers used to order and merge their results.

pub mod similarity;
pub mod types;

pub use similarity::{ScoredRecord, cosine_similarity, merge_tiers, rank_by_similarity};
pub use types::{MemoryRecord, Metadata, MetadataValue, Removals, TierState};
