//! Filter types for durable search operations
//!
//! Metadata equality filters are pushed down to LanceDB as a `LIKE` prefilter
//! over an encoded tag column, then re-checked exactly against the decoded
//! metadata. The tag encoding only emits URL-safe characters plus the `|` and
//! `=` separators, so user-supplied keys and values never reach SQL unescaped.

use std::collections::BTreeMap;

use crate::memory::{MemoryRecord, Metadata, MetadataValue};

/// Filter criteria for durable search operations.
///
/// Every listed key must be present with an equal value (AND logic).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub equals: BTreeMap<String, MetadataValue>,
}

impl MetadataFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`
    pub fn with_eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    /// Exact in-memory evaluation against a record
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| record.metadata.get(key) == Some(value))
    }

    /// Build a SQL WHERE clause over the `metadata_tags` column.
    /// Returns `None` if no filters are set.
    ///
    /// The clause may admit false positives (`_` and `%` inside encoded tags
    /// act as wildcards), never false negatives; callers re-check with
    /// [`MetadataFilter::matches`].
    pub fn to_sql_clause(&self) -> Option<String> {
        if self.equals.is_empty() {
            return None;
        }

        let conditions: Vec<String> = self
            .equals
            .iter()
            .map(|(key, value)| format!("metadata_tags LIKE '%|{}|%'", metadata_tag(key, value)))
            .collect();

        Some(conditions.join(" AND "))
    }
}

/// Encode one metadata pair as a tag
pub fn metadata_tag(key: &str, value: &MetadataValue) -> String {
    format!(
        "{}={}",
        urlencoding::encode(key),
        urlencoding::encode(&value.canonical())
    )
}

/// Encode a record's metadata into the `|tag|tag|` column value
pub fn encode_tags(metadata: &Metadata) -> String {
    if metadata.is_empty() {
        return String::new();
    }
    let mut out = String::from("|");
    for (key, value) in metadata {
        out.push_str(&metadata_tag(key, value));
        out.push('|');
    }
    out
}
