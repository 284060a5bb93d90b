//! Similarity scoring and result ranking shared by both tiers

use std::cmp::Ordering;
use std::collections::HashMap;

use uuid::Uuid;

use crate::memory::types::{MemoryRecord, TierState};

/// A record paired with its cosine similarity to a query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    /// Cosine similarity to the query, in [-1, 1]
    pub similarity: f32,
}

impl ScoredRecord {
    pub fn new(record: MemoryRecord, similarity: f32) -> Self {
        Self { record, similarity }
    }

    /// Score `record` against `query`
    pub fn score(query: &[f32], record: MemoryRecord) -> Self {
        let similarity = cosine_similarity(query, &record.embedding);
        Self { record, similarity }
    }
}

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Descending similarity, ties broken by most recent access
pub fn rank_by_similarity(results: &mut [ScoredRecord]) {
    results.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

/// Merge cache hits with durable hits into at most `top_k` results.
///
/// Duplicate ids keep the durable copy of the record (the durable tier is
/// authoritative) and are reported as [`TierState::Both`]. Equal similarities
/// list cache hits first.
pub fn merge_tiers(
    cache_hits: Vec<ScoredRecord>,
    durable_hits: Vec<ScoredRecord>,
    top_k: usize,
) -> Vec<ScoredRecord> {
    // (result, came_from_cache)
    let mut merged: Vec<(ScoredRecord, bool)> = Vec::with_capacity(cache_hits.len() + durable_hits.len());
    let mut index: HashMap<Uuid, usize> = HashMap::new();

    for mut hit in cache_hits {
        if index.contains_key(&hit.record.id) {
            continue;
        }
        hit.record.tier_state = TierState::Both;
        index.insert(hit.record.id, merged.len());
        merged.push((hit, true));
    }

    for mut hit in durable_hits {
        match index.get(&hit.record.id) {
            Some(&pos) => {
                let (existing, _) = &mut merged[pos];
                let last_accessed = existing
                    .record
                    .last_accessed_at
                    .max(hit.record.last_accessed_at);
                existing.record = hit.record;
                existing.record.last_accessed_at = last_accessed;
                existing.record.tier_state = TierState::Both;
                existing.similarity = existing.similarity.max(hit.similarity);
            }
            None => {
                hit.record.tier_state = TierState::DurableOnly;
                index.insert(hit.record.id, merged.len());
                merged.push((hit, false));
            }
        }
    }

    merged.sort_by(|(a, a_cached), (b, b_cached)| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| match (a_cached, b_cached) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            })
            .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
    });

    merged.truncate(top_k);
    merged.into_iter().map(|(hit, _)| hit).collect()
}
