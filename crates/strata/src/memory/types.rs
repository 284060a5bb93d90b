//! Record types for the Strata system
//!
//! Defines the memory record stored in both tiers, its scalar metadata
//! values, and the derived tier placement reported to callers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};

/// Ordered metadata attached to a record
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single semantically-indexed record.
///
/// `embedding` and `content` are write-once. `metadata` and `relationships`
/// change only when a write with the same `id` is re-issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier for this record
    pub id: Uuid,
    /// Fixed-dimension vector embedding
    pub embedding: Vec<f32>,
    /// Opaque payload
    pub content: String,
    /// Source, timestamps, relationship tags and similar
    pub metadata: Metadata,
    /// Where the record was found; derived, never stored
    #[serde(skip, default)]
    pub tier_state: TierState,
    /// When the record was first accepted
    pub created_at: DateTime<Utc>,
    /// Updated on every read that hits a tier
    pub last_accessed_at: DateTime<Utc>,
    /// Updated on every accepted write
    pub updated_at: DateTime<Utc>,
    /// Incremented on every accepted write
    pub version: u64,
    /// Weak references to other records
    pub relationships: BTreeSet<Uuid>,
    /// What this write drops from the stored record; never stored itself
    #[serde(skip, default)]
    pub removals: Removals,
}

/// Metadata keys and relationships a re-issued write removes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removals {
    pub metadata: BTreeSet<String>,
    pub relationships: BTreeSet<Uuid>,
}

impl Removals {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.relationships.is_empty()
    }
}

impl MemoryRecord {
    /// Create a new record with a fresh id
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self::with_id(Uuid::new_v4(), content, embedding)
    }

    /// Create a record with a caller-chosen id
    pub fn with_id(id: Uuid, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id,
            embedding,
            content: content.into(),
            metadata: Metadata::new(),
            tier_state: TierState::DurableOnly,
            created_at: now,
            last_accessed_at: now,
            updated_at: now,
            version: 0,
            relationships: BTreeSet::new(),
            removals: Removals::default(),
        }
    }

    /// Builder-style metadata insertion
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        let key = key.into();
        self.removals.metadata.remove(&key);
        self.metadata.insert(key, value.into());
        self
    }

    /// Builder-style relationship insertion
    pub fn with_relationship(mut self, other: Uuid) -> Self {
        self.removals.relationships.remove(&other);
        self.relationships.insert(other);
        self
    }

    /// Drop `key` from the stored record when this write is applied
    pub fn without_metadata(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.metadata.remove(&key);
        self.removals.metadata.insert(key);
        self
    }

    /// Drop the relationship to `other` when this write is applied
    pub fn without_relationship(mut self, other: Uuid) -> Self {
        self.relationships.remove(&other);
        self.removals.relationships.insert(other);
        self
    }

    /// Mark this record as read now
    pub fn mark_accessed(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Check the embedding against the configured dimension
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.embedding.len() != dimension {
            return Err(StrataError::InvalidRecord(format!(
                "record {} has embedding dimension {}, expected {}",
                self.id,
                self.embedding.len(),
                dimension
            )));
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(StrataError::InvalidRecord(format!(
                "record {} has a non-finite embedding component",
                self.id
            )));
        }
        Ok(())
    }

    /// Fold an incoming write for the same id into this stored record.
    ///
    /// Rejects changes to write-once fields. Metadata is merged key by key
    /// (the incoming value wins on overlapping keys) and relationships are
    /// unioned. Keys and relationships named in the incoming `removals` are
    /// then dropped. Fields the write does not mention are left alone, so
    /// concurrent writers touching different keys do not undo each other.
    /// `created_at` is preserved.
    pub fn merge_update(&self, incoming: &MemoryRecord) -> Result<MemoryRecord> {
        if self.embedding != incoming.embedding {
            return Err(StrataError::InvalidRecord(format!(
                "embedding of record {} is write-once",
                self.id
            )));
        }
        if self.content != incoming.content {
            return Err(StrataError::InvalidRecord(format!(
                "content of record {} is write-once",
                self.id
            )));
        }

        let mut merged = self.clone();
        for (key, value) in &incoming.metadata {
            merged.metadata.insert(key.clone(), value.clone());
        }
        merged
            .relationships
            .extend(incoming.relationships.iter().copied());
        for key in &incoming.removals.metadata {
            merged.metadata.remove(key);
        }
        for other in &incoming.removals.relationships {
            merged.relationships.remove(other);
        }
        merged.removals = Removals::default();
        merged.last_accessed_at = self.last_accessed_at.max(incoming.last_accessed_at);
        Ok(merged)
    }
}

/// A scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Stable, type-prefixed rendering used for filter tags
    pub fn canonical(&self) -> String {
        match self {
            MetadataValue::Bool(b) => format!("b:{b}"),
            MetadataValue::Integer(i) => format!("i:{i}"),
            MetadataValue::Float(f) => format!("f:{f}"),
            MetadataValue::Text(s) => format!("s:{s}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Which tiers a returned record was observed in.
///
/// Derived per read; the durable tier alone is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TierState {
    /// Served from the pending buffer or a cache entry not yet confirmed
    CacheOnly,
    /// Present only in the durable tier
    #[default]
    DurableOnly,
    /// Present in both tiers
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MemoryRecord {
        MemoryRecord::new("Test content", vec![0.1; 8])
            .with_metadata("source", "crm")
            .with_metadata("priority", 3_i64)
    }

    #[test]
    fn test_record_serialization() {
        let record = record().with_relationship(Uuid::new_v4());

        let json = serde_json::to_string(&record).expect("Failed to serialize record");
        let deserialized: MemoryRecord =
            serde_json::from_str(&json).expect("Failed to deserialize record");

        assert_eq!(record, deserialized);
    }

    #[test]
    fn test_metadata_value_untagged() {
        let values: Metadata = serde_json::from_str(
            r#"{"flag": true, "count": 7, "score": 0.5, "name": "alice"}"#,
        )
        .unwrap();

        assert_eq!(values["flag"], MetadataValue::Bool(true));
        assert_eq!(values["count"], MetadataValue::Integer(7));
        assert_eq!(values["score"], MetadataValue::Float(0.5));
        assert_eq!(values["name"], MetadataValue::Text("alice".to_string()));
    }

    #[test]
    fn test_new_defaults() {
        let record = MemoryRecord::new("x", vec![0.0; 4]);
        assert_eq!(record.version, 0);
        assert_eq!(record.tier_state, TierState::DurableOnly);
        assert!(record.metadata.is_empty());
        assert!(record.relationships.is_empty());
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_validate_dimension() {
        let record = record();
        assert!(record.validate(8).is_ok());
        assert!(matches!(
            record.validate(16),
            Err(StrataError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let mut record = record();
        record.embedding[3] = f32::NAN;
        assert!(record.validate(8).is_err());
    }

    #[test]
    fn test_merge_update_keeps_disjoint_keys() {
        let stored = record();
        let mut incoming = stored.clone();
        incoming.metadata.clear();
        incoming
            .metadata
            .insert("owner".to_string(), MetadataValue::from("bob"));
        incoming
            .metadata
            .insert("priority".to_string(), MetadataValue::from(5_i64));

        let merged = stored.merge_update(&incoming).unwrap();

        assert_eq!(merged.metadata["source"], MetadataValue::from("crm"));
        assert_eq!(merged.metadata["owner"], MetadataValue::from("bob"));
        assert_eq!(merged.metadata["priority"], MetadataValue::Integer(5));
        assert_eq!(merged.created_at, stored.created_at);
    }

    #[test]
    fn test_merge_update_unions_relationships() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let stored = record().with_relationship(a);
        let incoming = stored.clone().with_relationship(b);

        let merged = stored.merge_update(&incoming).unwrap();
        assert!(merged.relationships.contains(&a));
        assert!(merged.relationships.contains(&b));
    }

    #[test]
    fn test_merge_update_applies_removals() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let stored = record().with_relationship(a).with_relationship(b);
        let incoming =
            MemoryRecord::with_id(stored.id, stored.content.clone(), stored.embedding.clone())
                .without_metadata("priority")
                .without_relationship(a);

        let merged = stored.merge_update(&incoming).unwrap();

        assert!(!merged.metadata.contains_key("priority"));
        assert_eq!(merged.metadata["source"], MetadataValue::from("crm"));
        assert!(!merged.relationships.contains(&a));
        assert!(merged.relationships.contains(&b));
        assert!(merged.removals.is_empty());
    }

    #[test]
    fn test_later_builder_call_wins() {
        let readded = record().without_metadata("source").with_metadata("source", "web");
        assert!(readded.removals.is_empty());
        assert_eq!(readded.metadata["source"], MetadataValue::from("web"));

        let other = Uuid::new_v4();
        let dropped = record().with_relationship(other).without_relationship(other);
        assert!(dropped.relationships.is_empty());
        assert!(dropped.removals.relationships.contains(&other));
    }

    #[test]
    fn test_merge_update_rejects_embedding_change() {
        let stored = record();
        let mut incoming = stored.clone();
        incoming.embedding[0] = 0.9;

        assert!(matches!(
            stored.merge_update(&incoming),
            Err(StrataError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_merge_update_rejects_content_change() {
        let stored = record();
        let mut incoming = stored.clone();
        incoming.content = "rewritten".to_string();

        assert!(stored.merge_update(&incoming).is_err());
    }

    #[test]
    fn test_canonical_rendering() {
        assert_eq!(MetadataValue::from("crm").canonical(), "s:crm");
        assert_eq!(MetadataValue::from(3_i64).canonical(), "i:3");
        assert_eq!(MetadataValue::from(true).canonical(), "b:true");
        assert_eq!(MetadataValue::from(0.25).canonical(), "f:0.25");
    }
}
